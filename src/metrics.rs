use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

use crate::key::Endpoint;

#[derive(Clone, Hash, PartialEq, Eq, Debug, EncodeLabelSet)]
pub struct EndpointLabels {
	pub ip: String,
	pub port: u32,
}

impl From<Endpoint> for EndpointLabels {
	fn from(endpoint: Endpoint) -> Self {
		Self {
			ip: endpoint.addr.to_string(),
			port: u32::from(endpoint.port),
		}
	}
}

type EndpointCounter = Family<EndpointLabels, Counter>;

/// Table-level counters by endpoint. A default (unregistered) set still
/// counts, so the table never forces an exporter on its users.
#[derive(Debug, Default)]
pub struct Metrics {
	pub lookups: EndpointCounter,
	pub waits: EndpointCounter,
	pub timeouts: EndpointCounter,
	pub all_paths_down: EndpointCounter,
	pub inserts: EndpointCounter,
	pub removes: EndpointCounter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let mut build = |name: &str, help: &str| {
			let m = EndpointCounter::default();
			registry.register(name, help, m.clone());
			m
		};
		Metrics {
			lookups: build("conn_lookups", "The total number of connection lookups"),
			waits: build(
				"conn_waits",
				"The total number of times a task waited for an idle connection",
			),
			timeouts: build(
				"conn_wait_timeouts",
				"The total number of lookups that timed out waiting",
			),
			all_paths_down: build(
				"conn_all_paths_down",
				"The total number of lookups that found every path down",
			),
			inserts: build("conn_inserts", "The total number of connections added"),
			removes: build("conn_removes", "The total number of connections removed"),
		}
	}
}
