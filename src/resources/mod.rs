/// Istio networking CRDs used to open egress to the Dynatrace environment
pub mod istio;

/// The OneAgent CRD
pub mod oneagents;
