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

//! As part of Polkadot's availability system, certain pieces of data
//! for each block are required to be kept available.
//!
//! The way we accomplish this is by erasure coding the data into n pieces
//! and constructing a merkle root of the data.
//!
//! Each of n validators stores their piece of data. We assume `n = 3f + k`, `0 < k ≤ 3`.
//! f is the maximum number of faulty validators in the system.
//! The data is coded so any f+1 chunks can be used to reconstruct the full data.

use para_node_primitives::{AvailableData, Proof};
use para_primitives::{blake2_hash, Hash};
use parity_scale_codec::{Decode, Encode};

use novelpoly::{CodeParams, WrappedShard};
use sp_core::Blake2Hasher;
use sp_trie::{
	trie_types::{TrieDBBuilder, TrieDBMutBuilderV0},
	HashDBT, LayoutV0, MemoryDB, Recorder, Trie, TrieMut, EMPTY_PREFIX,
};

// we are limited to the field order of GF(2^16), which is 65536
const MAX_VALIDATORS: usize = 1 << 16;

/// Errors in erasure coding.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
	/// Returned when there are too many validators.
	#[error("There are too many validators")]
	TooManyValidators,
	/// Cannot encode something for zero or one validator
	#[error("Expected at least 2 validators")]
	NotEnoughValidators,
	/// Cannot reconstruct: wrong number of validators.
	#[error("Validator count mismatches between encoding and decoding")]
	WrongValidatorCount,
	/// Not enough chunks present.
	#[error("Not enough chunks to reconstruct message")]
	NotEnoughChunks,
	/// Too many chunks present.
	#[error("Too many chunks present")]
	TooManyChunks,
	/// Chunks not of uniform length or the chunks are empty.
	#[error("Chunks are not uniform, mismatch in length or are zero sized")]
	NonUniformChunks,
	/// An uneven byte-length of a shard is not valid for `GF(2^16)` encoding.
	#[error("Uneven length is not valid for field GF(2^16)")]
	UnevenLength,
	/// Chunk index out of bounds.
	#[error("Chunk is out of bounds: {chunk_index} not included in 0..{n_validators}")]
	ChunkIndexOutOfBounds { chunk_index: usize, n_validators: usize },
	/// Bad payload in reconstructed bytes.
	#[error("Reconstructed payload invalid")]
	BadPayload,
	/// Invalid branch proof.
	#[error("Invalid branch proof")]
	InvalidBranchProof,
	/// Branch out of bounds.
	#[error("Branch is out of bounds")]
	BranchOutOfBounds,
	/// Unknown error
	#[error("An unknown error has appeared when reconstructing erasure code chunks")]
	UnknownReconstruction,
	/// Unknown error
	#[error("An unknown error has appeared when deriving code parameters from validator count")]
	UnknownCodeParam,
}

/// A Reed-Solomon backend turning a payload into one shard per validator and back.
///
/// Shards produced by [`ErasureCoder::obtain_chunks`] for `n_validators` must be
/// recoverable by [`ErasureCoder::reconstruct`] from any
/// [`recovery_threshold`]`(n_validators)` of them.
pub trait ErasureCoder {
	/// Split `data` into `n_validators` chunks of equal length.
	fn obtain_chunks(&self, n_validators: usize, data: &[u8]) -> Result<Vec<Vec<u8>>, Error>;

	/// Recover the original bytes from `(chunk, index)` pairs.
	///
	/// The output may carry trailing padding; callers decode a self-delimiting encoding from it.
	fn reconstruct(&self, n_validators: usize, chunks: Vec<(&[u8], usize)>) -> Result<Vec<u8>, Error>;
}

/// Systematic Reed-Solomon over `GF(2^16)` backed by `reed-solomon-novelpoly`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NovelPoly;

impl ErasureCoder for NovelPoly {
	fn obtain_chunks(&self, n_validators: usize, data: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
		let params = code_params(n_validators)?;
		if data.is_empty() {
			return Err(Error::BadPayload)
		}

		let shards = params
			.make_encoder()
			.encode::<WrappedShard>(data)
			.expect("Payload non-empty, shard sizes are uniform, and validator numbers checked; qed");

		Ok(shards.into_iter().map(|w: WrappedShard| w.into_inner()).collect())
	}

	fn reconstruct(&self, n_validators: usize, chunks: Vec<(&[u8], usize)>) -> Result<Vec<u8>, Error> {
		let params = code_params(n_validators)?;
		let mut received_shards: Vec<Option<WrappedShard>> = vec![None; n_validators];
		let mut shard_len = None;
		for (chunk_data, chunk_idx) in chunks.into_iter().take(n_validators) {
			if chunk_idx >= n_validators {
				return Err(Error::ChunkIndexOutOfBounds { chunk_index: chunk_idx, n_validators })
			}

			let shard_len = shard_len.get_or_insert_with(|| chunk_data.len());

			if *shard_len % 2 != 0 {
				return Err(Error::UnevenLength)
			}

			if *shard_len != chunk_data.len() || *shard_len == 0 {
				return Err(Error::NonUniformChunks)
			}

			received_shards[chunk_idx] = Some(WrappedShard::new(chunk_data.to_vec()));
		}

		params.make_encoder().reconstruct(received_shards).map_err(|e| match e {
			novelpoly::Error::NeedMoreShards { .. } => Error::NotEnoughChunks,
			novelpoly::Error::WantedShardCountTooHigh { .. } => Error::TooManyValidators,
			novelpoly::Error::WantedShardCountTooLow { .. } => Error::NotEnoughValidators,
			_ => Error::UnknownReconstruction,
		})
	}
}

/// Obtain a threshold of chunks that should be enough to recover the data.
pub const fn recovery_threshold(n_validators: usize) -> Result<usize, Error> {
	if n_validators > MAX_VALIDATORS {
		return Err(Error::TooManyValidators)
	}
	if n_validators <= 1 {
		return Err(Error::NotEnoughValidators)
	}

	let needed = n_validators.saturating_sub(1) / 3;
	Ok(needed + 1)
}

fn code_params(n_validators: usize) -> Result<CodeParams, Error> {
	let n_wanted = n_validators;
	let k_wanted = recovery_threshold(n_wanted)?;

	CodeParams::derive_parameters(n_wanted, k_wanted).map_err(|e| match e {
		novelpoly::Error::WantedShardCountTooHigh { .. } => Error::TooManyValidators,
		novelpoly::Error::WantedShardCountTooLow { .. } => Error::NotEnoughValidators,
		_ => Error::UnknownCodeParam,
	})
}

/// Obtain erasure-coded chunks for v1 `AvailableData`, one for each validator.
///
/// Works only up to 65536 validators, and `n_validators` must be non-zero.
pub fn obtain_chunks_v1(n_validators: usize, data: &AvailableData) -> Result<Vec<Vec<u8>>, Error> {
	obtain_chunks(n_validators, data)
}

/// Obtain erasure-coded chunks, one for each validator.
///
/// Works only up to 65536 validators, and `n_validators` must be non-zero.
pub fn obtain_chunks<T: Encode>(n_validators: usize, data: &T) -> Result<Vec<Vec<u8>>, Error> {
	NovelPoly.obtain_chunks(n_validators, &data.encode())
}

/// Reconstruct the v1 available data from a set of chunks.
///
/// Provide an iterator containing chunk data and the corresponding index.
/// The indices of the present chunks must be indicated. If too few chunks
/// are provided, recovery is not possible.
///
/// Works only up to 65536 validators, and `n_validators` must be non-zero.
pub fn reconstruct_v1<'a, I: 'a>(n_validators: usize, chunks: I) -> Result<AvailableData, Error>
where
	I: IntoIterator<Item = (&'a [u8], usize)>,
{
	reconstruct(n_validators, chunks)
}

/// Reconstruct decodable data from a set of chunks.
///
/// Provide an iterator containing chunk data and the corresponding index.
/// The indices of the present chunks must be indicated. If too few chunks
/// are provided, recovery is not possible.
///
/// Works only up to 65536 validators, and `n_validators` must be non-zero.
pub fn reconstruct<'a, I: 'a, T: Decode>(n_validators: usize, chunks: I) -> Result<T, Error>
where
	I: IntoIterator<Item = (&'a [u8], usize)>,
{
	let payload_bytes = NovelPoly.reconstruct(n_validators, chunks.into_iter().collect())?;
	Decode::decode(&mut &payload_bytes[..]).map_err(|_| Error::BadPayload)
}

/// An iterator that yields merkle branches and chunk data for all chunks to
/// be sent to other validators.
pub struct Branches<'a, I> {
	trie_storage: MemoryDB<Blake2Hasher>,
	root: Hash,
	chunks: &'a [I],
	current_pos: usize,
}

impl<'a, I: AsRef<[u8]>> Branches<'a, I> {
	/// Get the trie root.
	pub fn root(&self) -> Hash {
		self.root
	}
}

impl<'a, I: AsRef<[u8]>> Iterator for Branches<'a, I> {
	type Item = (Proof, &'a [u8]);

	fn next(&mut self) -> Option<Self::Item> {
		let mut recorder = Recorder::<LayoutV0<Blake2Hasher>>::new();
		let res = {
			let trie = TrieDBBuilder::new(&self.trie_storage, &self.root)
				.with_recorder(&mut recorder)
				.build();

			(self.current_pos as u32).using_encoded(|s| trie.get(s))
		};

		match res.expect("all nodes in trie present; qed") {
			Some(_) => {
				let nodes = recorder.drain().into_iter().map(|r| r.data).collect();
				let chunk = self.chunks.get(self.current_pos).expect(
					"there is a one-to-one mapping of chunks to valid merkle branches; qed",
				);
				self.current_pos += 1;
				Some((nodes, chunk.as_ref()))
			},
			None => None,
		}
	}

	fn size_hint(&self) -> (usize, Option<usize>) {
		let remaining = self.chunks.len() - self.current_pos;
		(remaining, Some(remaining))
	}
}

/// Construct a trie from chunks of an erasure-coded value. This returns the root hash and an
/// iterator of merkle proofs, one for each validator.
pub fn branches<'a, I: 'a>(chunks: &'a [I]) -> Branches<'a, I>
where
	I: AsRef<[u8]>,
{
	let mut trie_storage: MemoryDB<Blake2Hasher> = MemoryDB::default();
	let mut root = Hash::default();

	// construct trie mapping each chunk's index to its hash.
	{
		let mut trie = TrieDBMutBuilderV0::new(&mut trie_storage, &mut root).build();
		for (i, chunk) in chunks.iter().enumerate() {
			(i as u32).using_encoded(|encoded_index| {
				let chunk_hash = blake2_hash(chunk.as_ref());
				trie.insert(encoded_index, chunk_hash.as_ref())
					.expect("a fresh trie stored in memory cannot have errors loading nodes; qed");
			})
		}
	}

	Branches { trie_storage, root, chunks, current_pos: 0 }
}

/// Compute the trie root of a set of chunks.
pub fn root<I: AsRef<[u8]>>(chunks: &[I]) -> Hash {
	branches(chunks).root()
}

/// Verify a merkle branch, yielding the chunk hash meant to be present at that
/// index.
pub fn branch_hash(root: &Hash, branch_nodes: &Proof, index: usize) -> Result<Hash, Error> {
	let mut trie_storage: MemoryDB<Blake2Hasher> = MemoryDB::default();
	for node in branch_nodes.iter() {
		HashDBT::insert(&mut trie_storage, EMPTY_PREFIX, node.as_slice());
	}

	let trie = TrieDBBuilder::new(&trie_storage, root).build();
	let res = (index as u32).using_encoded(|key| {
		trie.get_with(key, |raw_hash: &[u8]| Hash::decode(&mut &raw_hash[..]))
	});

	match res {
		Ok(Some(Ok(hash))) => Ok(hash),
		Ok(Some(Err(_))) => Err(Error::InvalidBranchProof), // hash failed to decode
		Ok(None) => Err(Error::BranchOutOfBounds),
		Err(_) => Err(Error::InvalidBranchProof),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use assert_matches::assert_matches;
	use para_node_primitives::{BlockData, PoV};
	use para_primitives::PersistedValidationData;
	use std::sync::Arc;

	fn available_data(block: Vec<u8>) -> AvailableData {
		AvailableData {
			pov: Arc::new(PoV { block_data: BlockData(block) }),
			validation_data: PersistedValidationData::default(),
		}
	}

	#[test]
	fn field_order_is_right_size() {
		assert_eq!(MAX_VALIDATORS, 65536);
	}

	#[test]
	fn recovery_threshold_follows_byzantine_bound() {
		assert_eq!(recovery_threshold(0), Err(Error::NotEnoughValidators));
		assert_eq!(recovery_threshold(1), Err(Error::NotEnoughValidators));
		assert_eq!(recovery_threshold(2), Ok(1));
		assert_eq!(recovery_threshold(4), Ok(2));
		assert_eq!(recovery_threshold(10), Ok(4));
		assert_eq!(recovery_threshold(MAX_VALIDATORS + 1), Err(Error::TooManyValidators));
	}

	#[test]
	fn round_trip_works() {
		let data = available_data((0..255).collect());
		let chunks = obtain_chunks_v1(10, &data).unwrap();

		assert_eq!(chunks.len(), 10);

		// any 4 chunks should work.
		let reconstructed: AvailableData = reconstruct_v1(
			10,
			[(&*chunks[1], 1), (&*chunks[4], 4), (&*chunks[6], 6), (&*chunks[9], 9)]
				.iter()
				.cloned(),
		)
		.unwrap();

		assert_eq!(reconstructed, data);
	}

	#[test]
	fn reconstruct_does_not_panic_on_low_validator_count() {
		let reconstructed = reconstruct_v1(1, [].iter().cloned());
		assert_eq!(reconstructed, Err(Error::NotEnoughValidators));
	}

	#[test]
	fn too_few_chunks_fail() {
		let data = available_data(vec![7; 64]);
		let chunks = obtain_chunks_v1(10, &data).unwrap();

		let reconstructed = reconstruct_v1(
			10,
			[(&*chunks[0], 0), (&*chunks[3], 3), (&*chunks[5], 5)].iter().cloned(),
		);
		assert_eq!(reconstructed, Err(Error::NotEnoughChunks));
	}

	#[test]
	fn chunk_index_out_of_bounds() {
		let data = available_data(vec![7; 64]);
		let chunks = obtain_chunks_v1(10, &data).unwrap();

		assert_matches!(
			reconstruct_v1(10, [(&*chunks[0], 10)].iter().cloned()),
			Err(Error::ChunkIndexOutOfBounds { chunk_index: 10, n_validators: 10 })
		);
	}

	#[test]
	fn non_uniform_chunks_fail() {
		let data = available_data(vec![7; 64]);
		let chunks = obtain_chunks_v1(10, &data).unwrap();
		let short = &chunks[1][..chunks[1].len() - 2];

		assert_eq!(
			reconstruct_v1(10, [(&*chunks[0], 0), (short, 1)].iter().cloned()),
			Err(Error::NonUniformChunks),
		);
	}

	#[test]
	fn root_is_stable() {
		let data = available_data((0..100).collect());
		let first = root(&obtain_chunks_v1(10, &data).unwrap());
		let second = root(&obtain_chunks_v1(10, &data).unwrap());
		assert_eq!(first, second);

		let other = root(&obtain_chunks_v1(10, &available_data((1..101).collect())).unwrap());
		assert_ne!(first, other);
	}

	#[test]
	fn construct_valid_branches() {
		let data = available_data((0..255).collect());
		let chunks = obtain_chunks_v1(10, &data).unwrap();

		assert_eq!(chunks.len(), 10);

		let branches = branches(chunks.as_ref());
		let root = branches.root();
		assert_eq!(root, super::root(&chunks));

		let proofs: Vec<_> = branches.map(|(proof, _)| proof).collect();
		assert_eq!(proofs.len(), 10);

		for (i, proof) in proofs.into_iter().enumerate() {
			assert_eq!(branch_hash(&root, &proof, i).unwrap(), blake2_hash(&chunks[i]));
		}
	}

	#[test]
	fn bad_branch_is_rejected() {
		let data = available_data((0..255).collect());
		let chunks = obtain_chunks_v1(10, &data).unwrap();
		let branches = branches(chunks.as_ref());
		let root = branches.root();
		let proofs: Vec<_> = branches.map(|(proof, _)| proof).collect();

		// the branch proves the hash of its own chunk only.
		assert_ne!(branch_hash(&root, &proofs[0], 0).unwrap(), blake2_hash(&chunks[1]));
		// nodes for another position are missing from the branch.
		assert_eq!(branch_hash(&root, &proofs[0], 1), Err(Error::InvalidBranchProof));
		// a branch doesn't prove anything under a different root.
		assert_eq!(
			branch_hash(&Hash::repeat_byte(1), &proofs[0], 0),
			Err(Error::InvalidBranchProof)
		);
		// the branch proves there is nothing beyond the last chunk.
		assert_eq!(branch_hash(&root, &proofs[0], 16), Err(Error::BranchOutOfBounds));
	}
}
