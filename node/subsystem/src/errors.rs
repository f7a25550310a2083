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

//! Error types for the subsystem requests.

use std::sync::Arc;

/// A description of an error causing the runtime API request to be unservable.
#[derive(thiserror::Error, Debug, Clone)]
pub enum RuntimeApiError {
	/// The runtime API cannot be executed due to a runtime error.
	#[error("The runtime API '{runtime_api_name}' cannot be executed: {source}")]
	Execution {
		/// The runtime API being called
		runtime_api_name: &'static str,
		/// The wrapped error. Marked as source for tracking the error chain.
		#[source]
		source: Arc<dyn 'static + std::error::Error + Send + Sync>,
	},

	/// The runtime API request in question cannot be executed because the runtime at the
	/// requested block is too old.
	#[error("The API is not supported by the runtime at the relay-parent")]
	NotSupported {
		/// The runtime API being called
		runtime_api_name: &'static str,
	},
}

/// A description of an error causing the chain API request to be unservable.
#[derive(Debug, Clone)]
pub struct ChainApiError {
	msg: String,
}

impl From<&str> for ChainApiError {
	fn from(s: &str) -> Self {
		s.to_owned().into()
	}
}

impl From<String> for ChainApiError {
	fn from(msg: String) -> Self {
		Self { msg }
	}
}

impl core::fmt::Display for ChainApiError {
	fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
		write!(f, "{}", self.msg)
	}
}

impl std::error::Error for ChainApiError {}
