use agent_core::strng::Strng;

/// A resource rejected during validation, folded into a NACK's `error_detail`.
#[derive(Debug)]
pub struct RejectedConfig {
	pub name: Strng,
	pub reason: anyhow::Error,
}

impl std::fmt::Display for RejectedConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}: {}", self.name, self.reason)
	}
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("connection error: {0}")]
	Connection(#[from] tonic::transport::Error),
	#[error("grpc error: {0}")]
	Grpc(#[source] tonic::Status),
	#[error("stream closed by server")]
	StreamClosed,
	#[error("xds resource error: {0}")]
	Resource(#[from] AdsError),
}

/// Wraps a [`tonic::Status`] with extra rendering for common causes (DNS failures, auth
/// rejections) that are otherwise opaque to an operator reading logs.
pub struct DisplayStatus<'a>(pub &'a tonic::Status);

impl std::fmt::Display for DisplayStatus<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = self.0;
		write!(f, "{:?}: {}", s.code(), s.message())?;
		match s.code() {
			tonic::Code::Unavailable => write!(f, " (is the control plane address reachable?)"),
			tonic::Code::Unauthenticated | tonic::Code::PermissionDenied => {
				write!(f, " (check control plane auth configuration)")
			},
			_ => Ok(()),
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum AdsError {
	#[error("unknown resource type: {0}")]
	UnknownResourceType(Strng),
	#[error("failed to decode resource {name}: {source}")]
	Decode {
		name: Strng,
		#[source]
		source: prost::DecodeError,
	},
	#[error("response missing resource name")]
	MissingResource,
	#[error("failed to encode request: {0}")]
	Encode(#[from] prost::EncodeError),
	#[error("duplicate resource name in response: {0}")]
	DuplicateName(Strng),
	#[error("resource type_url {got} does not match subscription {expected}")]
	TypeUrlMismatch { expected: Strng, got: Strng },
}
