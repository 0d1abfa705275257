// self
use crate::{
	obs::{FlowKind, FlowOutcome},
	realtime::ConnectionState,
};

/// Records a flow outcome via the global metrics recorder (when enabled).
pub fn record_flow_outcome(kind: FlowKind, outcome: FlowOutcome) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(
			"backoffice_session_flow_total",
			"flow" => kind.as_str(),
			"outcome" => outcome.as_str()
		)
		.increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = (kind, outcome);
	}
}

/// Counts realtime channel transitions into `state`.
pub fn record_connection_state(state: ConnectionState) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(
			"backoffice_session_realtime_transition_total",
			"state" => state.as_str()
		)
		.increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = state;
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn record_flow_outcome_noop_without_metrics() {
		record_flow_outcome(FlowKind::Refresh, FlowOutcome::Failure);
		record_connection_state(ConnectionState::Stopped);
	}

	#[test]
	fn outcome_follows_result() {
		assert_eq!(FlowOutcome::of(&Ok::<_, ()>(1)), FlowOutcome::Success);
		assert_eq!(FlowOutcome::of(&Err::<(), _>("nope")), FlowOutcome::Failure);
	}
}
