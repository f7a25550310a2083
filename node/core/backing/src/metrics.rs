// Copyright (C) Parity Technologies (UK) Ltd.
// This file is part of Polkadot.

// Polkadot is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Polkadot is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Polkadot.  If not, see <http://www.gnu.org/licenses/>.

use para_node_metrics::metrics::{self, prometheus};

#[derive(Clone)]
pub(crate) struct MetricsInner {
	pub(crate) signed_statements_total: prometheus::Counter<prometheus::U64>,
	pub(crate) candidates_seconded_total: prometheus::Counter<prometheus::U64>,
	pub(crate) process_second: prometheus::Histogram,
	pub(crate) process_statement: prometheus::Histogram,
	pub(crate) get_backed_candidates: prometheus::Histogram,
	pub(crate) validation_outcomes: prometheus::CounterVec<prometheus::U64>,
	pub(crate) candidates_backed_total: prometheus::Counter<prometheus::U64>,
	pub(crate) backing_votes: prometheus::Histogram,
	pub(crate) misbehaviors_total: prometheus::Counter<prometheus::U64>,
}

/// How a round of background validation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValidationOutcome {
	Valid,
	Invalid,
	/// The seconding validator didn't serve the PoV.
	NoPoV,
	Aborted,
}

impl ValidationOutcome {
	fn label(self) -> &'static str {
		match self {
			ValidationOutcome::Valid => "valid",
			ValidationOutcome::Invalid => "invalid",
			ValidationOutcome::NoPoV => "no_pov",
			ValidationOutcome::Aborted => "aborted",
		}
	}
}

/// Candidate backing metrics.
#[derive(Default, Clone)]
pub struct Metrics(pub(crate) Option<MetricsInner>);

type Timer = Option<metrics::prometheus::prometheus::HistogramTimer>;

impl Metrics {
	/// Record a statement signed by this node.
	pub fn on_statement_signed(&self) {
		if let Some(metrics) = &self.0 {
			metrics.signed_statements_total.inc();
		}
	}

	/// Record a candidate seconded by this node.
	pub fn on_candidate_seconded(&self) {
		if let Some(metrics) = &self.0 {
			metrics.candidates_seconded_total.inc();
		}
	}

	pub(crate) fn on_validation_outcome(&self, outcome: ValidationOutcome) {
		if let Some(metrics) = &self.0 {
			metrics.validation_outcomes.with_label_values(&[outcome.label()]).inc();
		}
	}

	/// Record a candidate becoming backed with the given number of validity votes.
	pub fn on_candidate_backed(&self, votes: usize) {
		if let Some(metrics) = &self.0 {
			metrics.candidates_backed_total.inc();
			metrics.backing_votes.observe(votes as f64);
		}
	}

	/// Record a misbehavior report leaving the subsystem.
	pub fn on_misbehavior_reported(&self) {
		if let Some(metrics) = &self.0 {
			metrics.misbehaviors_total.inc();
		}
	}

	/// Provide a timer for handling `CandidateBackingMessage::Second` which observes on drop.
	pub fn time_process_second(&self) -> Timer {
		self.0.as_ref().map(|metrics| metrics.process_second.start_timer())
	}

	/// Provide a timer for handling `CandidateBackingMessage::Statement` which observes on drop.
	pub fn time_process_statement(&self) -> Timer {
		self.0.as_ref().map(|metrics| metrics.process_statement.start_timer())
	}

	/// Provide a timer for handling `CandidateBackingMessage::GetBackedCandidates` which observes
	/// on drop.
	pub fn time_get_backed_candidates(&self) -> Timer {
		self.0.as_ref().map(|metrics| metrics.get_backed_candidates.start_timer())
	}
}

impl metrics::Metrics for Metrics {
	fn try_register(registry: &prometheus::Registry) -> Result<Self, prometheus::PrometheusError> {
		let metrics = MetricsInner {
			signed_statements_total: prometheus::register(
				prometheus::Counter::new(
					"parachain_candidate_backing_signed_statements_total",
					"Number of statements signed by the local validator.",
				)?,
				registry,
			)?,
			candidates_seconded_total: prometheus::register(
				prometheus::Counter::new(
					"parachain_candidate_backing_candidates_seconded_total",
					"Number of candidates seconded.",
				)?,
				registry,
			)?,
			process_second: prometheus::register(
				prometheus::Histogram::with_opts(prometheus::HistogramOpts::new(
					"parachain_candidate_backing_process_second",
					"Time spent handling a request to second a candidate",
				))?,
				registry,
			)?,
			process_statement: prometheus::register(
				prometheus::Histogram::with_opts(prometheus::HistogramOpts::new(
					"parachain_candidate_backing_process_statement",
					"Time spent importing a statement",
				))?,
				registry,
			)?,
			get_backed_candidates: prometheus::register(
				prometheus::Histogram::with_opts(prometheus::HistogramOpts::new(
					"parachain_candidate_backing_get_backed_candidates",
					"Time spent collecting backable candidates",
				))?,
				registry,
			)?,
			validation_outcomes: prometheus::register(
				prometheus::CounterVec::new(
					prometheus::Opts::new(
						"parachain_candidate_backing_validation_outcomes_total",
						"Number of background validations by how they ended.",
					),
					&["outcome"],
				)?,
				registry,
			)?,
			candidates_backed_total: prometheus::register(
				prometheus::Counter::new(
					"parachain_candidate_backing_candidates_backed_total",
					"Number of candidates which reached the backing threshold.",
				)?,
				registry,
			)?,
			backing_votes: prometheus::register(
				prometheus::Histogram::with_opts(
					prometheus::HistogramOpts::new(
						"parachain_candidate_backing_backing_votes",
						"Validity votes carried by a candidate when it became backed",
					)
					.buckets(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 8.0, 10.0]),
				)?,
				registry,
			)?,
			misbehaviors_total: prometheus::register(
				prometheus::Counter::new(
					"parachain_candidate_backing_misbehaviors_total",
					"Number of misbehavior reports forwarded to the provisioner.",
				)?,
				registry,
			)?,
		};
		Ok(Metrics(Some(metrics)))
	}
}
