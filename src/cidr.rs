//! Membership tests against a set of CIDR blocks.
//!
//! Each address family gets its own binary trie, one level per prefix bit.
//! Nodes live in an arena and refer to their children by index.

use crate::error::{InvalidCidr, Result};
use ipnet::IpNet;
use snafu::ResultExt as _;
use std::{iter::FromIterator, net::IpAddr};

const ROOT: usize = 0;

#[derive(Debug, Clone, Default)]
struct Node {
    /// A registered network ends here.
    terminal: bool,
    children: [Option<u32>; 2],
}

#[derive(Debug, Clone)]
struct BitTrie {
    width: u8,
    nodes: Vec<Node>,
}

impl BitTrie {
    fn new(width: u8) -> Self {
        BitTrie {
            width,
            nodes: vec![Node::default()],
        }
    }

    #[inline]
    fn bit(&self, bits: u128, depth: u8) -> usize {
        ((bits >> (self.width - 1 - depth)) & 1) as usize
    }

    fn insert(&mut self, bits: u128, prefix_len: u8) {
        let mut idx = ROOT;
        for depth in 0..prefix_len {
            let bit = self.bit(bits, depth);
            idx = match self.nodes[idx].children[bit] {
                Some(child) => child as usize,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[idx].children[bit] = Some(child as u32);
                    child
                }
            };
        }
        self.nodes[idx].terminal = true;
    }

    fn contains(&self, bits: u128) -> bool {
        let mut node = &self.nodes[ROOT];
        for depth in 0..self.width {
            // Any registered prefix on the way is a match; there is no need to
            // find the longest one.
            if node.terminal {
                return true;
            }
            match node.children[self.bit(bits, depth)] {
                Some(child) => node = &self.nodes[child as usize],
                None => return false,
            }
        }
        node.terminal
    }
}

/// A set of IPv4 and IPv6 networks answering "is this address in any of them".
///
/// Lookups take at most 32 (IPv4) or 128 (IPv6) steps regardless of how many
/// networks were added. Networks cannot be removed.
#[derive(Debug, Clone)]
pub struct CidrMatcher {
    v4: BitTrie,
    v6: BitTrie,
    len: usize,
}

impl Default for CidrMatcher {
    fn default() -> Self {
        CidrMatcher {
            v4: BitTrie::new(32),
            v6: BitTrie::new(128),
            len: 0,
        }
    }
}

impl CidrMatcher {
    pub fn new<I>(networks: I) -> Self
    where
        I: IntoIterator<Item = IpNet>,
    {
        networks.into_iter().collect()
    }

    /// Build a matcher from CIDR strings such as `"10.0.0.0/8"`.
    ///
    /// Fails on the first entry that does not parse.
    pub fn from_cidrs<I, S>(cidrs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matcher = Self::default();
        for cidr in cidrs {
            let cidr = cidr.as_ref();
            let net: IpNet = cidr.parse().context(InvalidCidr { cidr })?;
            matcher.add(net);
        }
        Ok(matcher)
    }

    /// Add a network. Duplicates and overlaps are fine.
    pub fn add(&mut self, net: IpNet) {
        match net {
            IpNet::V4(net) => self
                .v4
                .insert(u32::from(net.addr()) as u128, net.prefix_len()),
            IpNet::V6(net) => self.v6.insert(u128::from(net.addr()), net.prefix_len()),
        }
        self.len += 1;
    }

    /// Whether `ip` falls inside at least one added network.
    ///
    /// IPv4-mapped IPv6 addresses are looked up as IPv4.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(ip) => self.v4.contains(u32::from(ip) as u128),
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(ip) => self.v4.contains(u32::from(ip) as u128),
                None => self.v6.contains(u128::from(ip)),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// How many networks were added, duplicates included.
    pub fn len(&self) -> usize {
        self.len
    }
}

impl FromIterator<IpNet> for CidrMatcher {
    fn from_iter<I: IntoIterator<Item = IpNet>>(iter: I) -> Self {
        let mut matcher = Self::default();
        matcher.extend(iter);
        matcher
    }
}

impl Extend<IpNet> for CidrMatcher {
    fn extend<I: IntoIterator<Item = IpNet>>(&mut self, iter: I) {
        for net in iter {
            self.add(net);
        }
    }
}
