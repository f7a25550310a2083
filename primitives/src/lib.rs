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

//! Primitives shared between the parachain backing and availability subsystems.
//!
//! These are the relay-chain-facing data types: candidate receipts and their commitments,
//! persisted validation data, backed candidates, candidate events and availability cores.

#![warn(missing_docs)]

use bitvec::{order::Lsb0, vec::BitVec};
use parity_scale_codec::{Decode, Encode};
use sp_core::{crypto::KeyTypeId, sr25519};

mod signed;

pub use signed::{EncodeAs, Signed};
pub use sp_core::H256 as Hash;

/// Key type for parachain validator keys.
pub const PARACHAIN_KEY_TYPE_ID: KeyTypeId = KeyTypeId(*b"para");

/// The default number of validity votes required to back a candidate when the runtime does
/// not say otherwise.
pub const LEGACY_MIN_BACKING_VOTES: u32 = 2;

/// Relay-chain block number.
pub type BlockNumber = u32;

/// Index of a session.
pub type SessionIndex = u32;

/// Identity of a parachain validator.
pub type ValidatorId = sr25519::Public;

/// Signature of a parachain validator.
pub type ValidatorSignature = sr25519::Signature;

/// Identity of a collator.
pub type CollatorId = sr25519::Public;

/// Signature of a collator over a candidate descriptor.
pub type CollatorSignature = sr25519::Signature;

/// Hash `data` with BLAKE2b-256.
pub fn blake2_hash(data: &[u8]) -> Hash {
	Hash::from(sp_core::hashing::blake2_256(data))
}

/// Unique identifier of a parachain.
#[derive(
	Encode, Decode, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug,
)]
pub struct Id(pub u32);

impl From<u32> for Id {
	fn from(x: u32) -> Self {
		Id(x)
	}
}

/// Index of the validator in the session's validator set.
#[derive(
	Encode, Decode, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug,
)]
pub struct ValidatorIndex(pub u32);

impl From<u32> for ValidatorIndex {
	fn from(n: u32) -> Self {
		ValidatorIndex(n)
	}
}

/// Index of a validator group.
#[derive(
	Encode, Decode, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug,
)]
pub struct GroupIndex(pub u32);

impl From<u32> for GroupIndex {
	fn from(i: u32) -> Self {
		GroupIndex(i)
	}
}

/// Index of an availability core.
#[derive(
	Encode, Decode, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug,
)]
pub struct CoreIndex(pub u32);

impl From<u32> for CoreIndex {
	fn from(i: u32) -> Self {
		CoreIndex(i)
	}
}

/// Unique identifier of a candidate: the hash of its [`CandidateReceipt`].
#[derive(
	Encode, Decode, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug,
)]
pub struct CandidateHash(pub Hash);

impl std::fmt::Display for CandidateHash {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		std::fmt::Display::fmt(&self.0, f)
	}
}

/// Parachain head data included in the relay chain.
#[derive(Encode, Decode, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct HeadData(pub Vec<u8>);

impl HeadData {
	/// Returns the hash of this head data.
	pub fn hash(&self) -> Hash {
		blake2_hash(&self.0)
	}
}

impl From<Vec<u8>> for HeadData {
	fn from(v: Vec<u8>) -> Self {
		HeadData(v)
	}
}

/// Hash of a parachain's validation code.
#[derive(
	Encode, Decode, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug,
)]
pub struct ValidationCodeHash(pub Hash);

impl From<Hash> for ValidationCodeHash {
	fn from(hash: Hash) -> Self {
		ValidationCodeHash(hash)
	}
}

/// Parachain validation code.
#[derive(Encode, Decode, Clone, Default, PartialEq, Eq, Hash, Debug)]
pub struct ValidationCode(pub Vec<u8>);

impl ValidationCode {
	/// Returns the hash of the validation code.
	pub fn hash(&self) -> ValidationCodeHash {
		ValidationCodeHash(blake2_hash(&self.0))
	}
}

/// An outbound horizontal message.
#[derive(Encode, Decode, Clone, Default, PartialEq, Eq, Hash, Debug)]
pub struct OutboundHrmpMessage {
	/// The para that will get this message in its downward message queue.
	pub recipient: Id,
	/// The message payload.
	pub data: Vec<u8>,
}

/// A unique descriptor of the candidate receipt.
#[derive(Encode, Decode, Clone, PartialEq, Eq, Hash, Debug)]
pub struct CandidateDescriptor {
	/// The ID of the para this is a candidate for.
	pub para_id: Id,
	/// The hash of the relay-chain block this is executed in the context of.
	pub relay_parent: Hash,
	/// The collator's sr25519 public key.
	pub collator: CollatorId,
	/// The blake2-256 hash of the persisted validation data.
	pub persisted_validation_data_hash: Hash,
	/// The blake2-256 hash of the PoV.
	pub pov_hash: Hash,
	/// The root of a block's erasure encoding Merkle tree.
	pub erasure_root: Hash,
	/// Signature on blake2-256 of components of this receipt:
	/// the parachain index, the relay parent, the validation data hash, and the `pov_hash`.
	pub signature: CollatorSignature,
	/// Hash of the para header that is being generated by this candidate.
	pub para_head: Hash,
	/// The blake2-256 hash of the validation code bytes.
	pub validation_code_hash: ValidationCodeHash,
}

/// Commitments made in a `CandidateReceipt`. Many of these are outputs of validation.
#[derive(Encode, Decode, Clone, Default, PartialEq, Eq, Hash, Debug)]
pub struct CandidateCommitments {
	/// Messages destined to be interpreted by the Relay chain itself.
	pub upward_messages: Vec<Vec<u8>>,
	/// Horizontal messages sent by the parachain.
	pub horizontal_messages: Vec<OutboundHrmpMessage>,
	/// New validation code.
	pub new_validation_code: Option<ValidationCode>,
	/// The head-data produced as a result of execution.
	pub head_data: HeadData,
	/// The number of messages processed from the DMQ.
	pub processed_downward_messages: u32,
	/// The mark which specifies the block number up to which all inbound HRMP messages are
	/// processed.
	pub hrmp_watermark: BlockNumber,
}

impl CandidateCommitments {
	/// Compute the blake2-256 hash of the commitments.
	pub fn hash(&self) -> Hash {
		blake2_hash(&self.encode())
	}
}

/// A candidate-receipt.
#[derive(Encode, Decode, Clone, PartialEq, Eq, Hash, Debug)]
pub struct CandidateReceipt {
	/// The descriptor of the candidate.
	pub descriptor: CandidateDescriptor,
	/// The hash of the encoded commitments made as a result of candidate execution.
	pub commitments_hash: Hash,
}

impl CandidateReceipt {
	/// Get a reference to the candidate descriptor.
	pub fn descriptor(&self) -> &CandidateDescriptor {
		&self.descriptor
	}

	/// Computes the blake2-256 hash of the receipt.
	pub fn hash(&self) -> CandidateHash {
		CandidateHash(blake2_hash(&self.encode()))
	}
}

/// A candidate-receipt with commitments directly included.
#[derive(Encode, Decode, Clone, PartialEq, Eq, Hash, Debug)]
pub struct CommittedCandidateReceipt {
	/// The descriptor of the candidate.
	pub descriptor: CandidateDescriptor,
	/// The commitments of the candidate receipt.
	pub commitments: CandidateCommitments,
}

impl CommittedCandidateReceipt {
	/// Get a reference to the candidate descriptor.
	pub fn descriptor(&self) -> &CandidateDescriptor {
		&self.descriptor
	}

	/// Transforms this into a plain `CandidateReceipt`.
	pub fn to_plain(&self) -> CandidateReceipt {
		CandidateReceipt {
			descriptor: self.descriptor.clone(),
			commitments_hash: self.commitments.hash(),
		}
	}

	/// Computes the hash of the committed candidate receipt.
	///
	/// This computes the canonical hash, not the hash of the directly encoded data.
	/// Thus this is a shortcut for `candidate.to_plain().hash()`.
	pub fn hash(&self) -> CandidateHash {
		self.to_plain().hash()
	}

	/// Does this committed candidate receipt correspond to the given [`CandidateReceipt`]?
	pub fn corresponds_to(&self, receipt: &CandidateReceipt) -> bool {
		receipt.descriptor == self.descriptor && receipt.commitments_hash == self.commitments.hash()
	}
}

/// The validation data which is persisted as part of the availability payload.
#[derive(Encode, Decode, Clone, Default, PartialEq, Eq, Hash, Debug)]
pub struct PersistedValidationData {
	/// The parent head-data.
	pub parent_head: HeadData,
	/// The relay-chain block number this is in the context of.
	pub relay_parent_number: BlockNumber,
	/// The relay-chain block storage root this is in the context of.
	pub relay_parent_storage_root: Hash,
	/// The maximum legal size of a POV block, in bytes.
	pub max_pov_size: u32,
}

impl PersistedValidationData {
	/// Compute the blake2-256 hash of the persisted validation data.
	pub fn hash(&self) -> Hash {
		blake2_hash(&self.encode())
	}
}

/// A statement about a candidate, in the form that is signed and sent over the wire.
#[derive(Encode, Decode, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CompactStatement {
	/// Proposal of a parachain candidate.
	#[codec(index = 1)]
	Seconded(CandidateHash),
	/// State that a parachain candidate is valid.
	#[codec(index = 2)]
	Valid(CandidateHash),
}

impl CompactStatement {
	/// Get the underlying candidate hash this references.
	pub fn candidate_hash(&self) -> &CandidateHash {
		match self {
			CompactStatement::Seconded(h) | CompactStatement::Valid(h) => h,
		}
	}
}

/// An either implicit or explicit attestation to the validity of a parachain
/// candidate.
#[derive(Encode, Decode, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ValidityAttestation {
	/// Implicit validity attestation by issuing.
	/// This corresponds to issuance of a `Candidate` statement.
	#[codec(index = 1)]
	Implicit(ValidatorSignature),
	/// An explicit attestation. This corresponds to issuance of a
	/// `Valid` statement.
	#[codec(index = 2)]
	Explicit(ValidatorSignature),
}

impl ValidityAttestation {
	/// Produce the underlying signed payload of the attestation, given the hash of the candidate,
	/// which should be known in context.
	pub fn to_compact_statement(&self, candidate_hash: CandidateHash) -> CompactStatement {
		match *self {
			ValidityAttestation::Implicit(_) => CompactStatement::Seconded(candidate_hash),
			ValidityAttestation::Explicit(_) => CompactStatement::Valid(candidate_hash),
		}
	}

	/// Get a reference to the signature.
	pub fn signature(&self) -> &ValidatorSignature {
		match self {
			ValidityAttestation::Implicit(sig) | ValidityAttestation::Explicit(sig) => sig,
		}
	}
}

/// A backed (or backable, depending on context) candidate.
#[derive(Encode, Decode, Clone, PartialEq, Eq, Debug)]
pub struct BackedCandidate {
	/// The candidate referred to.
	pub candidate: CommittedCandidateReceipt,
	/// The validity votes themselves, expressed as signatures.
	pub validity_votes: Vec<ValidityAttestation>,
	/// The indices of the validators within the group, expressed as a bitfield.
	pub validator_indices: BitVec<u8, Lsb0>,
}

impl BackedCandidate {
	/// Get a reference to the descriptor of the para.
	pub fn descriptor(&self) -> &CandidateDescriptor {
		&self.candidate.descriptor
	}

	/// Compute this candidate's hash.
	pub fn hash(&self) -> CandidateHash {
		self.candidate.hash()
	}

	/// Get this candidate's receipt.
	pub fn receipt(&self) -> CandidateReceipt {
		self.candidate.to_plain()
	}
}

/// Verify the backing of the given candidate.
///
/// Provide a lookup from the index of a validator within the group assigned to this para,
/// as opposed to the index of the validator within the overall validator set, as well as
/// the number of validators in the group.
///
/// Also provide the signing context.
///
/// Returns either an error, indicating that one of the signatures was invalid or that the index
/// was out-of-bounds, or the number of signatures checked.
pub fn check_candidate_backing(
	backed: &BackedCandidate,
	signing_context: &SigningContext,
	group_len: usize,
	validator_lookup: impl Fn(usize) -> Option<ValidatorId>,
) -> Result<usize, ()> {
	if backed.validator_indices.len() != group_len {
		return Err(())
	}

	if backed.validity_votes.len() > group_len {
		return Err(())
	}

	let hash = backed.candidate.hash();

	let mut signed = 0;
	for ((val_in_group_idx, _), attestation) in backed
		.validator_indices
		.iter()
		.enumerate()
		.filter(|(_, signed)| **signed)
		.zip(backed.validity_votes.iter())
	{
		let validator_id = validator_lookup(val_in_group_idx).ok_or(())?;
		let payload = attestation.to_compact_statement(hash);
		let data = (payload, signing_context).encode();

		if signed::verify(attestation.signature(), &data, &validator_id) {
			signed += 1;
		} else {
			return Err(())
		}
	}

	if signed != backed.validity_votes.len() {
		return Err(())
	}

	Ok(signed)
}

/// The effective number of votes needed to back a candidate in a group of `group_len`.
pub fn effective_minimum_backing_votes(group_len: usize, configured_minimum_backing_votes: u32) -> usize {
	std::cmp::min(group_len, configured_minimum_backing_votes as usize)
}

/// A data type for the context in which statements are signed.
#[derive(Encode, Decode, Clone, PartialEq, Eq, Debug)]
pub struct SigningContext {
	/// Current session index.
	pub session_index: SessionIndex,
	/// Hash of the parent.
	pub parent_hash: Hash,
}

/// A candidate event, as emitted by the runtime for the parent of the block it is queried at.
#[derive(Encode, Decode, Clone, PartialEq, Eq, Debug)]
pub enum CandidateEvent {
	/// This candidate receipt was backed in the most recent block.
	#[codec(index = 0)]
	CandidateBacked(CandidateReceipt, HeadData, CoreIndex, GroupIndex),
	/// This candidate receipt was included and became a parablock at the most recent block.
	#[codec(index = 1)]
	CandidateIncluded(CandidateReceipt, HeadData, CoreIndex, GroupIndex),
	/// This candidate receipt was not made available in time and timed out.
	#[codec(index = 2)]
	CandidateTimedOut(CandidateReceipt, HeadData, CoreIndex),
}

/// A relay-chain block header.
#[derive(Encode, Decode, Clone, Default, PartialEq, Eq, Debug)]
pub struct Header {
	/// The parent hash.
	pub parent_hash: Hash,
	/// The block number.
	#[codec(compact)]
	pub number: BlockNumber,
	/// The state trie merkle root.
	pub state_root: Hash,
	/// The merkle root of the extrinsics.
	pub extrinsics_root: Hash,
	/// Opaque digest items.
	pub digest: Vec<u8>,
}

impl Header {
	/// The hash of the header.
	pub fn hash(&self) -> Hash {
		blake2_hash(&self.encode())
	}
}

/// Information about a core which is currently scheduled for a para.
#[derive(Encode, Decode, Clone, PartialEq, Eq, Debug)]
pub struct ScheduledCore {
	/// The ID of a para scheduled.
	pub para_id: Id,
	/// The collator required to author the block, if any.
	pub collator: Option<CollatorId>,
}

/// Information about a core which is currently occupied.
#[derive(Encode, Decode, Clone, PartialEq, Eq, Debug)]
pub struct OccupiedCore {
	/// If this core is freed by availability, this is the assignment that is next up on this
	/// core, if any. `None` if there is nothing queued for this core.
	pub next_up_on_available: Option<ScheduledCore>,
	/// The relay-chain block number this began occupying the core at.
	pub occupied_since: BlockNumber,
	/// The relay-chain block this will time-out at, if any.
	pub time_out_at: BlockNumber,
	/// If this core is freed by being timed-out, this is the assignment that is next up on this
	/// core. `None` if there is nothing queued for this core.
	pub next_up_on_time_out: Option<ScheduledCore>,
	/// A bitfield with 1 bit for each validator in the set. `1` bits mean that the corresponding
	/// validators has attested to availability on-chain.
	pub availability: BitVec<u8, Lsb0>,
	/// The group assigned to distribute availability pieces of this candidate.
	pub group_responsible: GroupIndex,
	/// The hash of the candidate occupying the core.
	pub candidate_hash: CandidateHash,
	/// The descriptor of the candidate occupying the core.
	pub candidate_descriptor: CandidateDescriptor,
}

/// The state of a particular availability core.
#[derive(Encode, Decode, Clone, PartialEq, Eq, Debug)]
pub enum CoreState {
	/// The core is currently occupied.
	#[codec(index = 0)]
	Occupied(OccupiedCore),
	/// The core is currently free, with a para scheduled and given the opportunity
	/// to occupy.
	#[codec(index = 1)]
	Scheduled(ScheduledCore),
	/// The core is currently free and there is nothing scheduled.
	#[codec(index = 2)]
	Free,
}

impl CoreState {
	/// If this core state has a `para_id`, return it.
	pub fn para_id(&self) -> Option<Id> {
		match self {
			Self::Occupied(ref core) => Some(core.candidate_descriptor.para_id),
			Self::Scheduled(ScheduledCore { para_id, .. }) => Some(*para_id),
			Self::Free => None,
		}
	}

	/// Is this core state `Self::Occupied`?
	pub fn is_occupied(&self) -> bool {
		matches!(self, Self::Occupied(_))
	}
}

/// Information about validator groups and their rotation.
#[derive(Encode, Decode, Clone, Default, PartialEq, Eq, Debug)]
pub struct GroupRotationInfo {
	/// The block number where the session started.
	pub session_start_block: BlockNumber,
	/// How often groups rotate. 0 means never.
	pub group_rotation_frequency: BlockNumber,
	/// The current block number.
	pub now: BlockNumber,
}

impl GroupRotationInfo {
	/// Returns the index of the group needed to validate the core at the given index, assuming
	/// the given number of cores.
	///
	/// `core_index` should be less than `cores`, which is capped at `u32::max()`.
	pub fn group_for_core(&self, core_index: CoreIndex, cores: usize) -> GroupIndex {
		if self.group_rotation_frequency == 0 {
			return GroupIndex(core_index.0)
		}
		if cores == 0 {
			return GroupIndex(0)
		}

		let cores = std::cmp::min(cores, u32::MAX as usize);
		let blocks_since_start = self.now.saturating_sub(self.session_start_block);
		let rotations = blocks_since_start / self.group_rotation_frequency;

		// g = c + r mod cores
		let idx = (core_index.0 as usize + rotations as usize) % cores;
		GroupIndex(idx as u32)
	}
}

/// Candidate's acceptance limitations for asynchronous backing per relay parent.
#[derive(Encode, Decode, Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct AsyncBackingParams {
	/// The maximum number of para blocks between the para head in a relay parent
	/// and a new candidate. Restricts nodes from building arbitrary long chains
	/// and spamming other validators.
	///
	/// When async backing is disabled, the only valid value is 0.
	pub max_candidate_depth: u32,
	/// How many ancestors of a relay parent are allowed to build candidates on top
	/// of.
	///
	/// When async backing is disabled, the only valid value is 0.
	pub allowed_ancestry_len: u32,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn group_rotation_is_cyclic() {
		let info =
			GroupRotationInfo { session_start_block: 10, group_rotation_frequency: 5, now: 10 };
		assert_eq!(info.group_for_core(CoreIndex(0), 3), GroupIndex(0));
		assert_eq!(info.group_for_core(CoreIndex(2), 3), GroupIndex(2));

		let info = GroupRotationInfo { now: 16, ..info };
		assert_eq!(info.group_for_core(CoreIndex(0), 3), GroupIndex(1));
		assert_eq!(info.group_for_core(CoreIndex(2), 3), GroupIndex(0));
	}

	#[test]
	fn no_rotation_maps_core_to_group() {
		let info = GroupRotationInfo::default();
		assert_eq!(info.group_for_core(CoreIndex(7), 3), GroupIndex(7));
	}

	#[test]
	fn effective_minimum_is_capped_by_group_size() {
		assert_eq!(effective_minimum_backing_votes(1, 2), 1);
		assert_eq!(effective_minimum_backing_votes(5, 2), 2);
		assert_eq!(effective_minimum_backing_votes(0, LEGACY_MIN_BACKING_VOTES), 0);
	}

	#[test]
	fn committed_receipt_hash_matches_plain() {
		let descriptor = CandidateDescriptor {
			para_id: Id(1),
			relay_parent: Hash::repeat_byte(1),
			collator: sr25519::Public::from_raw([0; 32]),
			persisted_validation_data_hash: Hash::repeat_byte(2),
			pov_hash: Hash::repeat_byte(3),
			erasure_root: Hash::repeat_byte(4),
			signature: sr25519::Signature::from_raw([0; 64]),
			para_head: Hash::repeat_byte(5),
			validation_code_hash: ValidationCodeHash(Hash::repeat_byte(6)),
		};
		let committed = CommittedCandidateReceipt {
			descriptor,
			commitments: CandidateCommitments {
				head_data: HeadData(vec![1, 2, 3]),
				..Default::default()
			},
		};

		let plain = committed.to_plain();
		assert_eq!(committed.hash(), plain.hash());
		assert!(committed.corresponds_to(&plain));
	}
}
