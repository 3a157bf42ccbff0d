use clax::{field, meta, Expr, MetaField, OffsetGroups, Packet, PROTO_IPV4, PROTO_IPV6};
use proptest::prelude::*;

// --- Fixed packet schema (20-byte IPv4-style header) ---
// byte 0      : version/IHL (version in the high nibble)
// byte 1      : TOS
// bytes 2..4  : total length
// byte 8      : TTL
// byte 9      : protocol
// bytes 12..16: source address
// bytes 16..20: destination address

pub const PACKET_LEN: usize = 20;

/// Byte values the generators draw from. A small alphabet shared between
/// packets and match constants so comparisons hit both outcomes.
const BYTES: &[u8] = &[0x00, 0x01, 0x06, 0x11, 0x40, 0x45, 0x80, 0xff];

/// Generate a packet that fits the fixed schema, with a random protocol
/// meta-field.
pub fn arb_packet() -> impl Strategy<Value = Packet> {
    (
        prop::collection::vec(prop::sample::select(BYTES), PACKET_LEN),
        prop::sample::select(&[PROTO_IPV4, PROTO_IPV6][..]),
    )
        .prop_map(|(data, proto)| Packet::new(data).with_protocol(proto as u16))
}

/// Generate a leaf comparison on a random field from the schema. Leaves are
/// pure: no policing, no decisions.
fn arb_leaf_expr() -> impl Strategy<Value = Expr> {
    let p = OffsetGroups::PACKET;
    prop_oneof![
        // protocol byte equality
        prop::sample::select(BYTES).prop_map(move |v| field(p, 9, 1).eq(u32::from(v))),
        // version nibble
        prop::sample::select(&[0x40_u32, 0x60][..])
            .prop_map(move |v| field(p, 0, 1).mask(0xf0_u32).eq(v)),
        // destination /24 prefix
        (prop::sample::select(BYTES), prop::sample::select(BYTES)).prop_map(move |(a, b)| {
            let net = (u32::from(a) << 24) | (u32::from(b) << 16);
            field(p, 16, 4).mask(0xffff_ff00_u32).eq(net)
        }),
        // TTL inequalities (one byte keeps the lowered alternative count small)
        prop::sample::select(BYTES).prop_map(move |v| field(p, 8, 1).ge(u32::from(v))),
        prop::sample::select(BYTES).prop_map(move |v| field(p, 8, 1).lt(u32::from(v))),
        // masked TTL inequality
        prop::sample::select(&[0x10_u32, 0x40, 0x80][..])
            .prop_map(move |v| field(p, 8, 1).mask(0xf0_u32).ge(v)),
        // total length threshold
        prop::sample::select(&[64_u32, 576, 1500][..])
            .prop_map(move |v| field(p, 2, 2).ge(v)),
        // meta protocol dispatch
        prop::sample::select(&[PROTO_IPV4, PROTO_IPV6][..])
            .prop_map(|v| meta(MetaField::Protocol).eq(v)),
    ]
}

/// Generate a composite match expression (AND, OR, NOT of leaves), bounded
/// depth. Still pure.
pub fn arb_match_expr(max_depth: u32) -> impl Strategy<Value = Expr> {
    arb_leaf_expr().prop_recursive(max_depth, 16, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a.and(b)),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a.or(b)),
            inner.prop_map(|e| !e),
        ]
    })
}
