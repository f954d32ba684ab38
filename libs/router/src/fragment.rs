use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use ip_packet::{IpNumber, IpPacket, Ipv4Header};

/// Incomplete reassemblies are dropped after this long.
const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on concurrent reassemblies; beyond it the oldest entry goes.
const MAX_ENTRIES: usize = 64;

/// Reassembles fragmented IPv4 datagrams.
///
/// Keyed by `(src, dst, protocol, identification)`. Feeding the final missing
/// fragment yields the coalesced datagram.
pub(crate) struct FragmentTable {
    entries: HashMap<Key, Reassembly>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    src: IpAddr,
    dst: IpAddr,
    protocol: IpNumber,
    ident: u16,
}

struct Reassembly {
    /// Fragment payloads by byte offset.
    fragments: BTreeMap<usize, Vec<u8>>,
    /// Header of the offset-zero fragment; reused for the reassembled packet.
    first_header: Option<Ipv4Header>,
    /// Total payload length, known once the last fragment arrived.
    total_len: Option<usize>,
    started_at: Instant,
}

impl FragmentTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Stores one fragment.
    ///
    /// Returns the fully reassembled datagram once all fragments are present,
    /// `None` while more are outstanding.
    pub(crate) fn add(&mut self, packet: &IpPacket, now: Instant) -> Result<Option<IpPacket>> {
        self.expire(now);

        let fragment = packet
            .fragment_header()
            .context("Packet is not a fragment")?;

        let key = Key {
            src: packet.source(),
            dst: packet.destination(),
            protocol: packet.next_header(),
            ident: fragment.ident,
        };

        if !self.entries.contains_key(&key) && self.entries.len() >= MAX_ENTRIES {
            self.drop_oldest();
        }

        let entry = self.entries.entry(key).or_insert_with(|| Reassembly {
            fragments: BTreeMap::new(),
            first_header: None,
            total_len: None,
            started_at: now,
        });

        let payload = packet.payload().to_vec();

        if fragment.offset == 0 {
            entry.first_header = packet.ipv4_header();
        }

        if !fragment.more_fragments {
            entry.total_len = Some(fragment.offset + payload.len());
        }

        entry.fragments.insert(fragment.offset, payload);

        let Some(total_len) = entry.total_len else {
            return Ok(None);
        };

        if !is_complete(&entry.fragments, total_len) {
            return Ok(None);
        }

        let entry = self.entries.remove(&key).expect("entry was just inserted");
        let header = entry
            .first_header
            .context("Reassembly completed without its first fragment")?;

        let mut payload = Vec::with_capacity(total_len);
        for (offset, fragment) in entry.fragments {
            // Overlaps are resolved in favour of earlier bytes.
            if offset < payload.len() {
                let skip = payload.len() - offset;

                if skip < fragment.len() {
                    payload.extend_from_slice(&fragment[skip..]);
                }

                continue;
            }

            payload.extend_from_slice(&fragment);
        }

        let reassembled = ip_packet::make::ipv4_from_header(header, &payload)
            .context("Failed to build reassembled packet")?;

        Ok(Some(reassembled))
    }

    fn expire(&mut self, now: Instant) {
        self.entries
            .retain(|_, entry| now.duration_since(entry.started_at) < REASSEMBLY_TIMEOUT);
    }

    fn drop_oldest(&mut self) {
        let Some(oldest) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.started_at)
            .map(|(key, _)| *key)
        else {
            return;
        };

        tracing::debug!(?oldest, "Fragment table full; dropping oldest reassembly");

        self.entries.remove(&oldest);
    }
}

/// Whether `fragments` contiguously covers `0..total_len`.
fn is_complete(fragments: &BTreeMap<usize, Vec<u8>>, total_len: usize) -> bool {
    let mut covered = 0;

    for (offset, fragment) in fragments {
        if *offset > covered {
            return false;
        }

        covered = covered.max(offset + fragment.len());
    }

    covered >= total_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use ip_packet::IpFragOffset;

    /// Splits a UDP datagram into IPv4 fragments of `chunk` payload bytes.
    fn fragments_of(payload_len: usize, chunk: usize) -> Vec<IpPacket> {
        let full = ip_packet::make::udp_packet(
            "10.0.0.9:5000".parse().unwrap(),
            "10.0.0.2:6000".parse().unwrap(),
            vec![0x5a; payload_len],
        )
        .unwrap();

        let header = full.ipv4_header().unwrap();
        let l3_payload = full.payload();

        let mut packets = Vec::new();
        let mut offset = 0;

        while offset < l3_payload.len() {
            let end = usize::min(offset + chunk, l3_payload.len());

            let mut fragment_header = header.clone();
            fragment_header.identification = 7;
            fragment_header.more_fragments = end < l3_payload.len();
            fragment_header.fragment_offset =
                IpFragOffset::try_new((offset / 8) as u16).unwrap();
            fragment_header
                .set_payload_len(end - offset)
                .unwrap();
            fragment_header.header_checksum = fragment_header.calc_header_checksum();

            let mut bytes = Vec::new();
            fragment_header.write(&mut bytes).unwrap();
            bytes.extend_from_slice(&l3_payload[offset..end]);

            packets.push(IpPacket::from_slice(&bytes).unwrap());

            offset = end;
        }

        packets
    }

    #[test]
    fn reassembles_two_fragments() {
        let mut table = FragmentTable::new();
        let now = Instant::now();

        let fragments = fragments_of(3000, 1480);
        assert_eq!(fragments.len(), 3);

        let mut reassembled = None;
        for fragment in &fragments {
            reassembled = table.add(fragment, now).unwrap();
        }

        let packet = reassembled.expect("last fragment completes the datagram");
        let udp = packet.as_udp().unwrap();

        assert_eq!(udp.payload().len(), 3000);
        assert!(udp.payload().iter().all(|b| *b == 0x5a));
    }

    #[test]
    fn out_of_order_fragments_reassemble() {
        let mut table = FragmentTable::new();
        let now = Instant::now();

        let mut fragments = fragments_of(2000, 1000);
        fragments.reverse();

        let mut reassembled = None;
        for fragment in &fragments {
            reassembled = table.add(fragment, now).unwrap();
        }

        assert!(reassembled.is_some());
    }

    #[test]
    fn incomplete_reassembly_expires() {
        let mut table = FragmentTable::new();
        let now = Instant::now();

        let fragments = fragments_of(2000, 1000);
        assert!(table.add(&fragments[0], now).unwrap().is_none());

        // The first fragment expired, so the final one doesn't complete anything.
        let later = now + REASSEMBLY_TIMEOUT + Duration::from_secs(1);
        assert!(table.add(&fragments[1], later).unwrap().is_none());
    }
}
