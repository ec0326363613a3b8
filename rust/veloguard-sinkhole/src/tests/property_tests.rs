//! Property-based tests for the wire codec, reassembly and timeout scaling

use crate::checksum;
use crate::packet::{decode, TcpFlags, TcpOptions, Transport, IPPROTO_TCP, IPPROTO_UDP, IPV4_HEADER_LEN};
use crate::session::{scaled_timeout, udp_timeout};
use crate::tcp::ForwardQueue;
use crate::wire::{build_tcp, build_udp, TcpSegment};
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

fn addr_pair_strategy() -> impl Strategy<Value = (IpAddr, IpAddr)> {
    prop_oneof![
        (any::<u32>(), any::<u32>()).prop_map(|(a, b)| (
            IpAddr::V4(Ipv4Addr::from(a)),
            IpAddr::V4(Ipv4Addr::from(b))
        )),
        (any::<u128>(), any::<u128>()).prop_map(|(a, b)| (
            IpAddr::V6(Ipv6Addr::from(a)),
            IpAddr::V6(Ipv6Addr::from(b))
        )),
    ]
}

fn flags_strategy() -> impl Strategy<Value = TcpFlags> {
    (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(fin, syn, rst, psh, ack)| TcpFlags {
            fin,
            syn,
            rst,
            psh,
            ack,
            urg: false,
        },
    )
}

fn options_strategy() -> impl Strategy<Value = TcpOptions> {
    (prop::option::of(536u16..=9000), prop::option::of(0u8..=14))
        .prop_map(|(mss, window_scale)| TcpOptions { mss, window_scale })
}

/// A stream cut into contiguous segments, each tagged with its offset.
fn stream_strategy() -> impl Strategy<Value = (Vec<u8>, Vec<(usize, usize)>)> {
    prop::collection::vec(1usize..40, 1..12).prop_flat_map(|sizes| {
        let total: usize = sizes.iter().sum();
        let mut bounds = Vec::with_capacity(sizes.len());
        let mut off = 0;
        for n in &sizes {
            bounds.push((off, *n));
            off += n;
        }
        (prop::collection::vec(any::<u8>(), total), Just(bounds))
    })
}

fn assert_ipv4_header_valid(data: &[u8]) {
    if data[0] >> 4 == 4 {
        assert_eq!(checksum::checksum(&data[..IPV4_HEADER_LEN]), 0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn tcp_segments_decode_and_verify(
        (src, dst) in addr_pair_strategy(),
        sport in 1u16..=u16::MAX,
        dport in 1u16..=u16::MAX,
        seq in any::<u32>(),
        ack in any::<u32>(),
        flags in flags_strategy(),
        window in any::<u16>(),
        options in options_strategy(),
        payload in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let seg = TcpSegment { sport, dport, seq, ack, flags, window, options, payload: &payload };
        let bytes = build_tcp(src, dst, &seg);
        assert_ipv4_header_valid(&bytes);

        let pkt = decode(&bytes, true).unwrap();
        prop_assert_eq!(pkt.protocol, IPPROTO_TCP);
        prop_assert_eq!(pkt.src, src);
        prop_assert_eq!(pkt.dst, dst);
        prop_assert_eq!(checksum::transport_checksum(src, dst, IPPROTO_TCP, pkt.transport_bytes()), 0);

        let Transport::Tcp(hdr) = pkt.transport else {
            return Err(TestCaseError::fail("not decoded as TCP"));
        };
        prop_assert_eq!(hdr.sport, sport);
        prop_assert_eq!(hdr.dport, dport);
        prop_assert_eq!(hdr.seq, seq);
        prop_assert_eq!(hdr.ack, if flags.ack { ack } else { 0 });
        prop_assert_eq!(hdr.flags, flags);
        prop_assert_eq!(hdr.window, window);
        prop_assert_eq!(hdr.options, options);
        prop_assert_eq!(pkt.payload(), &payload[..]);
    }

    #[test]
    fn udp_datagrams_decode_and_verify(
        (src, dst) in addr_pair_strategy(),
        sport in 1u16..=u16::MAX,
        dport in 1u16..=u16::MAX,
        payload in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let bytes = build_udp(src, dst, sport, dport, &payload);
        assert_ipv4_header_valid(&bytes);

        let pkt = decode(&bytes, true).unwrap();
        prop_assert_eq!(pkt.protocol, IPPROTO_UDP);
        prop_assert_eq!(pkt.sport(), sport);
        prop_assert_eq!(pkt.dport(), dport);
        prop_assert_eq!(checksum::transport_checksum(src, dst, IPPROTO_UDP, pkt.transport_bytes()), 0);
        prop_assert_eq!(pkt.payload(), &payload[..]);
    }

    #[test]
    fn reassembly_yields_stream_once(
        (stream, bounds) in stream_strategy(),
        start in any::<u32>(),
        order in prop::collection::vec(any::<prop::sample::Index>(), 1..40),
    ) {
        // Every segment at least once, in a shuffled order, with repeats.
        let mut arrivals: Vec<usize> = order.iter().map(|i| i.index(bounds.len())).collect();
        arrivals.extend(0..bounds.len());

        let mut queue = ForwardQueue::new();
        let mut remote_seq = start;
        let mut out = Vec::new();
        for i in arrivals {
            let (off, len) = bounds[i];
            let seq = start.wrapping_add(off as u32);
            queue.insert(remote_seq, seq, &stream[off..off + len], false);
            let outcome = queue.drain(&mut remote_seq, usize::MAX, |data, _more| {
                out.extend_from_slice(data);
                Ok(data.len())
            });
            prop_assert!(outcome.error.is_none());
        }

        prop_assert_eq!(out, stream.clone());
        prop_assert_eq!(remote_seq, start.wrapping_add(stream.len() as u32));
        prop_assert!(queue.is_empty());
    }

    #[test]
    fn scaled_timeout_never_grows_with_load(base in 0u64..100_000, max in 1usize..10_000, n in 0usize..10_000) {
        let n = n.min(max - 1);
        prop_assert!(scaled_timeout(base, n + 1, max) <= scaled_timeout(base, n, max));
        prop_assert!(scaled_timeout(base, n, max) <= base);
        prop_assert_eq!(scaled_timeout(base, max, max), 0);
    }

    #[test]
    fn udp_timeout_never_grows_with_load(base in 0u64..100_000, scale in 1usize..500, n in 0usize..100_000) {
        prop_assert!(udp_timeout(base, n + 1, scale) <= udp_timeout(base, n, scale));
        prop_assert!(udp_timeout(base, n, scale) <= base);
    }
}
