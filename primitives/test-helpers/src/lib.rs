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


#![forbid(unused_crate_dependencies)]
#![forbid(unused_extern_crates)]

//! A set of primitive constructors, to aid in crafting meaningful testcase while reducing repetition.
//!
//! Note that `dummy_` prefixed values are meant to be fillers, that should not matter.

use para_primitives::{
	CandidateCommitments, CandidateDescriptor, CandidateReceipt, CollatorId, CollatorSignature,
	CommittedCandidateReceipt, Hash, HeadData, Id as ParaId, PersistedValidationData,
	ValidationCode, ValidationCodeHash,
};
use sp_core::sr25519;

/// Creates a candidate receipt with filler data.
pub fn dummy_candidate_receipt(relay_parent: Hash) -> CandidateReceipt {
	CandidateReceipt {
		commitments_hash: dummy_candidate_commitments(dummy_head_data()).hash(),
		descriptor: dummy_candidate_descriptor(relay_parent),
	}
}

/// Creates a committed candidate receipt with filler data.
pub fn dummy_committed_candidate_receipt(relay_parent: Hash) -> CommittedCandidateReceipt {
	CommittedCandidateReceipt {
		descriptor: dummy_candidate_descriptor(relay_parent),
		commitments: dummy_candidate_commitments(dummy_head_data()),
	}
}

/// Create candidate commitments with filler data.
pub fn dummy_candidate_commitments(head_data: impl Into<Option<HeadData>>) -> CandidateCommitments {
	CandidateCommitments {
		head_data: head_data.into().unwrap_or(dummy_head_data()),
		upward_messages: vec![],
		new_validation_code: None,
		horizontal_messages: vec![],
		processed_downward_messages: 0,
		hrmp_watermark: 0_u32,
	}
}

/// Create meaningless dummy hash.
pub fn dummy_hash() -> Hash {
	Hash::zero()
}

/// Create a candidate descriptor with filler data.
pub fn dummy_candidate_descriptor(relay_parent: Hash) -> CandidateDescriptor {
	let zeros = Hash::zero();
	make_candidate_descriptor(
		1.into(),
		relay_parent,
		zeros,
		zeros,
		dummy_validation_code().hash(),
		zeros,
		zeros,
	)
}

/// Create meaningless validation code.
pub fn dummy_validation_code() -> ValidationCode {
	ValidationCode(vec![1, 2, 3])
}

/// Create meaningless head data.
pub fn dummy_head_data() -> HeadData {
	HeadData(vec![])
}

/// Create meaningless persisted validation data.
pub fn dummy_pvd(parent_head: HeadData, relay_parent_number: u32) -> PersistedValidationData {
	PersistedValidationData {
		parent_head,
		relay_parent_number,
		relay_parent_storage_root: dummy_hash(),
		max_pov_size: 5 * 1024 * 1024,
	}
}

/// Create a meaningless collator id.
pub fn dummy_collator() -> CollatorId {
	sr25519::Public::from_raw([0; 32])
}

/// Create a meaningless collator signature.
pub fn dummy_collator_signature() -> CollatorSignature {
	sr25519::Signature::from_raw([0u8; 64])
}

/// Create a new candidate descriptor with a filler collator and signature.
pub fn make_candidate_descriptor(
	para_id: ParaId,
	relay_parent: Hash,
	persisted_validation_data_hash: Hash,
	pov_hash: Hash,
	validation_code_hash: impl Into<ValidationCodeHash>,
	para_head: Hash,
	erasure_root: Hash,
) -> CandidateDescriptor {
	CandidateDescriptor {
		para_id,
		relay_parent,
		collator: dummy_collator(),
		persisted_validation_data_hash,
		pov_hash,
		erasure_root,
		signature: dummy_collator_signature(),
		para_head,
		validation_code_hash: validation_code_hash.into(),
	}
}
