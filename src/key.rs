use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::Hasher;
use std::net::Ipv4Addr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::errors::Error;

// Drawn once per process: keys are stable for the table's lifetime and
// unpredictable across runs.
static HASH_SEED: Lazy<u32> = Lazy::new(rand::random);

/// Remote endpoint identity: IPv4 address and TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
	pub addr: Ipv4Addr,
	pub port: u16,
}

impl Endpoint {
	pub fn new(addr: Ipv4Addr, port: u16) -> Self {
		Self { addr, port }
	}

	/// Accepts dotted-quad IPv4 literals only. Hostnames and IPv6 are
	/// rejected; callers resolve names before they reach the table.
	pub fn parse(ip: &str, port: u16) -> Result<Self, Error> {
		let addr: Ipv4Addr = ip
			.parse()
			.map_err(|_| Error::InvalidAddress(ip.to_string()))?;
		Ok(Self { addr, port })
	}

	pub(crate) fn key(&self) -> u32 {
		let mut h = DefaultHasher::new();
		h.write_u32(*HASH_SEED);
		h.write_u32(u32::from(self.addr));
		h.write_u16(self.port);
		h.finish() as u32
	}
}

impl fmt::Display for Endpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.addr, self.port)
	}
}
