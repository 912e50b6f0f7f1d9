//! ctnetlink event decoding.
//!
//! Decodes the datagrams the kernel multicasts to conntrack event groups:
//! netlink header, `nfgenmsg`, then nested attributes.

use crate::domain::FlowKey;
use crate::error::CaptureError;

/// Netlink message header length
const NLMSG_HDRLEN: usize = 16;
/// Netfilter generic message header length
const NFGENMSG_LEN: usize = 4;
/// Netlink attribute header length
const NLA_HDRLEN: usize = 4;
/// Strips NLA_F_NESTED and NLA_F_NET_BYTEORDER from an attribute type
const NLA_TYPE_MASK: u16 = 0x3fff;

/// Netlink control message types
const NLMSG_NOOP: u16 = 1;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLMSG_OVERRUN: u16 = 4;

/// ctnetlink subsystem and the message type used for new and updated entries
const NFNL_SUBSYS_CTNETLINK: u16 = 1;
const IPCTNL_MSG_CT_NEW: u16 = 0;

/// Attribute codes (linux/netfilter/nfnetlink_conntrack.h)
mod attr {
    pub const CTA_TUPLE_ORIG: u16 = 1;
    pub const CTA_COUNTERS_ORIG: u16 = 9;

    pub const CTA_TUPLE_IP: u16 = 1;
    pub const CTA_TUPLE_PROTO: u16 = 2;

    pub const CTA_IP_V4_SRC: u16 = 1;
    pub const CTA_IP_V4_DST: u16 = 2;
    pub const CTA_IP_V6_SRC: u16 = 3;
    pub const CTA_IP_V6_DST: u16 = 4;

    pub const CTA_PROTO_NUM: u16 = 1;
    pub const CTA_PROTO_SRC_PORT: u16 = 2;
    pub const CTA_PROTO_DST_PORT: u16 = 3;

    pub const CTA_COUNTERS_BYTES: u16 = 2;
    pub const CTA_COUNTERS32_BYTES: u16 = 4;
}

/// The flow identifying part of one conntrack event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConntrackEvent {
    /// Attributes of the original direction tuple
    pub key: FlowKey,
    /// Original direction byte counter, when accounting is enabled
    pub orig_bytes: Option<u64>,
}

/// Round up to the 4 byte netlink alignment.
fn align(len: usize) -> usize {
    (len + 3) & !3
}

fn read_u16_ne(buf: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32_ne(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Decode every message of a datagram.
///
/// Control messages and non-conntrack messages yield nothing; each
/// conntrack message yields an event or the per-event error that dropped it.
pub fn parse_datagram(buf: &[u8]) -> Vec<Result<ConntrackEvent, CaptureError>> {
    let mut results = Vec::new();
    let mut offset = 0;

    while buf.len() - offset >= NLMSG_HDRLEN {
        let msg_len = read_u32_ne(buf, offset) as usize;
        let msg_type = read_u16_ne(buf, offset + 4);

        if msg_len < NLMSG_HDRLEN || msg_len > buf.len() - offset {
            results.push(Err(CaptureError::MalformedEvent(format!(
                "netlink message length {msg_len} out of bounds"
            ))));
            break;
        }

        let payload = &buf[offset + NLMSG_HDRLEN..offset + msg_len];
        match msg_type {
            NLMSG_NOOP | NLMSG_DONE => {}
            NLMSG_ERROR | NLMSG_OVERRUN => results.push(Err(CaptureError::MalformedEvent(
                format!("netlink control message type {msg_type}"),
            ))),
            t if t >> 8 == NFNL_SUBSYS_CTNETLINK && t & 0xff == IPCTNL_MSG_CT_NEW => {
                results.push(parse_ct_message(payload));
            }
            _ => {}
        }

        offset += align(msg_len);
        if offset >= buf.len() {
            break;
        }
    }

    results
}

/// Split a buffer into (type, payload) attribute pairs.
fn attributes(buf: &[u8]) -> Result<Vec<(u16, &[u8])>, CaptureError> {
    let mut attrs = Vec::new();
    let mut offset = 0;

    while buf.len() - offset >= NLA_HDRLEN {
        let len = read_u16_ne(buf, offset) as usize;
        let ty = read_u16_ne(buf, offset + 2) & NLA_TYPE_MASK;
        if len < NLA_HDRLEN || len > buf.len() - offset {
            return Err(CaptureError::MalformedEvent(format!(
                "attribute {ty} length {len} out of bounds"
            )));
        }
        attrs.push((ty, &buf[offset + NLA_HDRLEN..offset + len]));
        offset += align(len);
        if offset >= buf.len() {
            break;
        }
    }

    Ok(attrs)
}

fn find<'a>(attrs: &[(u16, &'a [u8])], ty: u16) -> Option<&'a [u8]> {
    attrs.iter().find(|(t, _)| *t == ty).map(|(_, data)| *data)
}

fn parse_ct_message(payload: &[u8]) -> Result<ConntrackEvent, CaptureError> {
    if payload.len() < NFGENMSG_LEN {
        return Err(CaptureError::MalformedEvent(
            "conntrack message shorter than nfgenmsg".to_string(),
        ));
    }
    let top = attributes(&payload[NFGENMSG_LEN..])?;

    let tuple = find(&top, attr::CTA_TUPLE_ORIG)
        .ok_or_else(|| CaptureError::MalformedEvent("no original tuple".to_string()))?;
    let tuple = attributes(tuple)?;

    let ip = match find(&tuple, attr::CTA_TUPLE_IP) {
        Some(ip) => attributes(ip)?,
        None => Vec::new(),
    };

    let mut key = FlowKey {
        src_addr: address(&ip, attr::CTA_IP_V6_SRC, attr::CTA_IP_V4_SRC, "source")?,
        dst_addr: address(&ip, attr::CTA_IP_V6_DST, attr::CTA_IP_V4_DST, "destination")?,
        ..FlowKey::default()
    };

    // ports and protocol are optional and stay zero when absent
    if let Some(proto) = find(&tuple, attr::CTA_TUPLE_PROTO) {
        let proto = attributes(proto)?;
        if let Some(num) = find(&proto, attr::CTA_PROTO_NUM) {
            key.protocol = *num
                .first()
                .ok_or_else(|| CaptureError::MalformedEvent("empty protocol number".to_string()))?;
        }
        if let Some(port) = find(&proto, attr::CTA_PROTO_SRC_PORT) {
            key.src_port = be_port(port)?;
        }
        if let Some(port) = find(&proto, attr::CTA_PROTO_DST_PORT) {
            key.dst_port = be_port(port)?;
        }
    }

    let orig_bytes = match find(&top, attr::CTA_COUNTERS_ORIG) {
        Some(counters) => counter_bytes(&attributes(counters)?),
        None => None,
    };

    Ok(ConntrackEvent { key, orig_bytes })
}

/// IPv6 form preferred over IPv4; neither is `MissingAddress`.
fn address(
    ip: &[(u16, &[u8])],
    v6: u16,
    v4: u16,
    which: &'static str,
) -> Result<[u8; 16], CaptureError> {
    let mut out = [0u8; 16];
    if let Some(data) = find(ip, v6) {
        let bytes = data.get(..16).ok_or_else(|| {
            CaptureError::MalformedEvent(format!("short IPv6 {which} address"))
        })?;
        out.copy_from_slice(bytes);
    } else if let Some(data) = find(ip, v4) {
        let bytes = data.get(..4).ok_or_else(|| {
            CaptureError::MalformedEvent(format!("short IPv4 {which} address"))
        })?;
        out[..4].copy_from_slice(bytes);
    } else {
        return Err(CaptureError::MissingAddress(which));
    }
    Ok(out)
}

fn be_port(data: &[u8]) -> Result<u16, CaptureError> {
    match data {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(CaptureError::MalformedEvent("short port attribute".to_string())),
    }
}

fn counter_bytes(counters: &[(u16, &[u8])]) -> Option<u64> {
    if let Some(data) = find(counters, attr::CTA_COUNTERS_BYTES) {
        let raw: [u8; 8] = data.get(..8)?.try_into().ok()?;
        return Some(u64::from_be_bytes(raw));
    }
    let data = find(counters, attr::CTA_COUNTERS32_BYTES)?;
    let raw: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u64::from(u32::from_be_bytes(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NLA_F_NESTED: u16 = 0x8000;

    fn nla(ty: u16, payload: &[u8]) -> Vec<u8> {
        let len = (NLA_HDRLEN + payload.len()) as u16;
        let mut out = Vec::new();
        out.extend_from_slice(&len.to_ne_bytes());
        out.extend_from_slice(&ty.to_ne_bytes());
        out.extend_from_slice(payload);
        out.resize(align(out.len()), 0);
        out
    }

    fn nested(ty: u16, children: &[Vec<u8>]) -> Vec<u8> {
        nla(ty | NLA_F_NESTED, &children.concat())
    }

    fn message(msg_type: u16, attrs: &[Vec<u8>]) -> Vec<u8> {
        let mut body = vec![2u8, 0, 0, 0]; // nfgenmsg: AF_INET, version 0
        body.extend(attrs.concat());
        let len = (NLMSG_HDRLEN + body.len()) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(&len.to_ne_bytes());
        out.extend_from_slice(&msg_type.to_ne_bytes());
        out.extend_from_slice(&0u16.to_ne_bytes());
        out.extend_from_slice(&0u32.to_ne_bytes());
        out.extend_from_slice(&0u32.to_ne_bytes());
        out.extend(body);
        out
    }

    const CT_NEW: u16 = (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_NEW;

    fn v4_tuple(proto: Option<Vec<u8>>) -> Vec<u8> {
        let mut children = vec![nested(
            attr::CTA_TUPLE_IP,
            &[
                nla(attr::CTA_IP_V4_SRC, &[192, 168, 1, 10]),
                nla(attr::CTA_IP_V4_DST, &[93, 184, 216, 34]),
            ],
        )];
        if let Some(p) = proto {
            children.push(p);
        }
        nested(attr::CTA_TUPLE_ORIG, &children)
    }

    fn tcp_proto() -> Vec<u8> {
        nested(
            attr::CTA_TUPLE_PROTO,
            &[
                nla(attr::CTA_PROTO_NUM, &[6]),
                nla(attr::CTA_PROTO_SRC_PORT, &51515u16.to_be_bytes()),
                nla(attr::CTA_PROTO_DST_PORT, &443u16.to_be_bytes()),
            ],
        )
    }

    #[test]
    fn test_parse_ipv4_tcp_event() {
        let datagram = message(CT_NEW, &[v4_tuple(Some(tcp_proto()))]);
        let results = parse_datagram(&datagram);
        assert_eq!(results.len(), 1);

        let event = results.into_iter().next().unwrap().unwrap();
        assert_eq!(
            event.key,
            FlowKey::new(
                "192.168.1.10".parse().unwrap(),
                "93.184.216.34".parse().unwrap(),
                51515,
                443,
                6
            )
        );
        assert_eq!(event.orig_bytes, None);
    }

    #[test]
    fn test_ipv6_preferred_over_ipv4() {
        let v6_src = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let v6_dst = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];
        let tuple = nested(
            attr::CTA_TUPLE_ORIG,
            &[nested(
                attr::CTA_TUPLE_IP,
                &[
                    nla(attr::CTA_IP_V4_SRC, &[10, 0, 0, 1]),
                    nla(attr::CTA_IP_V6_SRC, &v6_src),
                    nla(attr::CTA_IP_V4_DST, &[10, 0, 0, 2]),
                    nla(attr::CTA_IP_V6_DST, &v6_dst),
                ],
            )],
        );
        let event = parse_datagram(&message(CT_NEW, &[tuple]))
            .remove(0)
            .unwrap();
        assert_eq!(event.key.src_addr, v6_src);
        assert_eq!(event.key.dst_addr, v6_dst);
    }

    #[test]
    fn test_missing_proto_leaves_zero() {
        let event = parse_datagram(&message(CT_NEW, &[v4_tuple(None)]))
            .remove(0)
            .unwrap();
        assert_eq!(event.key.protocol, 0);
        assert_eq!(event.key.src_port, 0);
        assert_eq!(event.key.dst_port, 0);
    }

    #[test]
    fn test_missing_source_address() {
        let tuple = nested(
            attr::CTA_TUPLE_ORIG,
            &[nested(
                attr::CTA_TUPLE_IP,
                &[nla(attr::CTA_IP_V4_DST, &[10, 0, 0, 2])],
            )],
        );
        let result = parse_datagram(&message(CT_NEW, &[tuple])).remove(0);
        assert!(matches!(result, Err(CaptureError::MissingAddress("source"))));
    }

    #[test]
    fn test_missing_destination_address() {
        let tuple = nested(
            attr::CTA_TUPLE_ORIG,
            &[nested(
                attr::CTA_TUPLE_IP,
                &[nla(attr::CTA_IP_V4_SRC, &[10, 0, 0, 1])],
            )],
        );
        let result = parse_datagram(&message(CT_NEW, &[tuple])).remove(0);
        assert!(matches!(
            result,
            Err(CaptureError::MissingAddress("destination"))
        ));
    }

    #[test]
    fn test_short_address_is_malformed() {
        let tuple = nested(
            attr::CTA_TUPLE_ORIG,
            &[nested(
                attr::CTA_TUPLE_IP,
                &[
                    nla(attr::CTA_IP_V4_SRC, &[10, 0]),
                    nla(attr::CTA_IP_V4_DST, &[10, 0, 0, 2]),
                ],
            )],
        );
        let result = parse_datagram(&message(CT_NEW, &[tuple])).remove(0);
        assert!(matches!(result, Err(CaptureError::MalformedEvent(_))));
    }

    #[test]
    fn test_counters_orig_bytes() {
        let counters = nested(
            attr::CTA_COUNTERS_ORIG,
            &[
                nla(1, &7u64.to_be_bytes()),
                nla(attr::CTA_COUNTERS_BYTES, &1234u64.to_be_bytes()),
            ],
        );
        let event = parse_datagram(&message(CT_NEW, &[v4_tuple(Some(tcp_proto())), counters]))
            .remove(0)
            .unwrap();
        assert_eq!(event.orig_bytes, Some(1234));
    }

    #[test]
    fn test_multiple_messages_and_control_messages() {
        let mut datagram = message(CT_NEW, &[v4_tuple(Some(tcp_proto()))]);
        datagram.extend(message(NLMSG_NOOP, &[]));
        datagram.extend(message(CT_NEW, &[v4_tuple(None)]));
        // delete events are not flow updates
        datagram.extend(message((NFNL_SUBSYS_CTNETLINK << 8) | 2, &[v4_tuple(None)]));

        let results = parse_datagram(&datagram);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn test_truncated_message_is_malformed() {
        let mut datagram = message(CT_NEW, &[v4_tuple(Some(tcp_proto()))]);
        datagram.truncate(datagram.len() - 6);
        let results = parse_datagram(&datagram);
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(CaptureError::MalformedEvent(_))));
    }

    #[test]
    fn test_garbage_attribute_length_is_malformed() {
        let mut datagram = message(CT_NEW, &[v4_tuple(None)]);
        // corrupt the first attribute length after nfgenmsg
        let first_attr = NLMSG_HDRLEN + NFGENMSG_LEN;
        datagram[first_attr..first_attr + 2].copy_from_slice(&0xfff0u16.to_ne_bytes());
        let results = parse_datagram(&datagram);
        assert!(matches!(results[0], Err(CaptureError::MalformedEvent(_))));
    }

    #[test]
    fn test_empty_datagram() {
        assert!(parse_datagram(&[]).is_empty());
    }
}
