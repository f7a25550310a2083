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


//! Convenient interface to runtime information.

use para_node_subsystem::{errors::RuntimeApiError, SubsystemSender};
use para_primitives::{Hash, SessionIndex, LEGACY_MIN_BACKING_VOTES};

use crate::{request_async_backing_params, request_min_backing_votes_raw, LOG_TARGET};

/// Errors that can happen on runtime fetches.
mod error;

use error::recv_runtime;
pub use error::{Error, FatalError, JfyiError, Result};

/// Prospective parachains mode of a relay parent. Defined by
/// the Runtime API version.
///
/// Needed for the period of transition to asynchronous backing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProspectiveParachainsMode {
	/// Runtime API without support of `async_backing_params`: no prospective parachains.
	Disabled,
	/// v6 runtime API: prospective parachains.
	Enabled {
		/// The maximum number of para blocks between the para head in a relay parent
		/// and a new candidate. Restricts nodes from building arbitrary long chains
		/// and spamming other validators.
		max_candidate_depth: usize,
		/// How many ancestors of a relay parent are allowed to build candidates on top
		/// of.
		allowed_ancestry_len: usize,
	},
}

impl ProspectiveParachainsMode {
	/// Returns `true` if mode is enabled, `false` otherwise.
	pub fn is_enabled(&self) -> bool {
		matches!(self, ProspectiveParachainsMode::Enabled { .. })
	}
}

/// Requests prospective parachains mode for a given relay parent based on
/// the Runtime API version.
pub async fn prospective_parachains_mode<Sender>(
	sender: &mut Sender,
	relay_parent: Hash,
) -> Result<ProspectiveParachainsMode>
where
	Sender: SubsystemSender,
{
	let result = recv_runtime(request_async_backing_params(relay_parent, sender).await).await;

	if let Err(error::Error::RuntimeRequest(RuntimeApiError::NotSupported { runtime_api_name })) =
		&result
	{
		tracing::trace!(
			target: LOG_TARGET,
			?relay_parent,
			"Prospective parachains are disabled, {} is not supported by the current Runtime API",
			runtime_api_name,
		);

		Ok(ProspectiveParachainsMode::Disabled)
	} else {
		let params = result?;
		Ok(ProspectiveParachainsMode::Enabled {
			max_candidate_depth: params.max_candidate_depth as _,
			allowed_ancestry_len: params.allowed_ancestry_len as _,
		})
	}
}

/// Request the minimum number of backing votes for the session at the given relay parent.
///
/// Falls back to [`LEGACY_MIN_BACKING_VOTES`] if the runtime does not know the request.
pub async fn request_min_backing_votes<Sender>(
	parent: Hash,
	session_index: SessionIndex,
	sender: &mut Sender,
) -> Result<u32>
where
	Sender: SubsystemSender,
{
	let min_backing_votes_res =
		recv_runtime(request_min_backing_votes_raw(parent, session_index, sender).await).await;

	if let Err(Error::RuntimeRequest(RuntimeApiError::NotSupported { .. })) = min_backing_votes_res
	{
		tracing::trace!(
			target: LOG_TARGET,
			?parent,
			"Querying the backing threshold from the runtime is not supported by the current Runtime API",
		);

		Ok(LEGACY_MIN_BACKING_VOTES)
	} else {
		min_backing_votes_res
	}
}
