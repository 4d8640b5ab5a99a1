use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
	#[error("invalid ipv4 literal: {0}")]
	InvalidAddress(String),
	#[error("no connection for endpoint")]
	NotFound,
	#[error("resource busy")]
	Busy,
	#[error("all paths down")]
	AllPathsDown,
	#[error("timed out waiting for an idle connection")]
	Timeout,
}
