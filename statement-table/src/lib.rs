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

//! The statement table.
//!
//! Collects signed statements about parachain candidates from the members of a
//! backing group, tallies validity votes, and records provable misbehavior.

pub mod generic;

pub use generic::{Config, Context, Error, Table};

/// Concrete instantiations suitable for v1 protocol.
pub mod v1 {
	use crate::generic;
	use para_primitives::{
		CandidateHash, CommittedCandidateReceipt, CompactStatement as PrimitiveStatement,
		Id, ValidatorIndex, ValidatorSignature,
	};

	/// Statements about candidates on the network.
	pub type Statement = generic::Statement<CommittedCandidateReceipt, CandidateHash>;

	/// Signed statements about candidates.
	pub type SignedStatement = generic::SignedStatement<
		CommittedCandidateReceipt,
		CandidateHash,
		ValidatorIndex,
		ValidatorSignature,
	>;

	/// Kinds of misbehavior, along with proof.
	pub type Misbehavior = generic::Misbehavior<
		CommittedCandidateReceipt,
		CandidateHash,
		ValidatorIndex,
		ValidatorSignature,
	>;

	/// A summary of import of a statement.
	pub type Summary = generic::Summary<CandidateHash, Id>;

	/// An attested candidate ready for inclusion in a backed candidate.
	pub type AttestedCandidate = generic::AttestedCandidate<
		Id,
		CommittedCandidateReceipt,
		ValidatorIndex,
		ValidatorSignature,
	>;

	impl<'a> From<&'a Statement> for PrimitiveStatement {
		fn from(s: &'a Statement) -> PrimitiveStatement {
			match *s {
				generic::Statement::Valid(s) => PrimitiveStatement::Valid(s),
				generic::Statement::Seconded(ref s) => PrimitiveStatement::Seconded(s.hash()),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::{
		generic::{Misbehavior, Statement, ValidityAttestation},
		v1, Config, Context, Table,
	};
	use para_primitives::{
		CandidateCommitments, CandidateHash, CommittedCandidateReceipt, Hash, Id as ParaId,
		ValidatorIndex, ValidatorSignature,
	};
	use std::collections::HashMap;

	struct TestContext {
		groups: HashMap<ParaId, Vec<ValidatorIndex>>,
	}

	impl Context for TestContext {
		type AuthorityId = ValidatorIndex;
		type Digest = CandidateHash;
		type GroupId = ParaId;
		type Signature = ValidatorSignature;
		type Candidate = CommittedCandidateReceipt;

		fn candidate_digest(candidate: &CommittedCandidateReceipt) -> CandidateHash {
			candidate.hash()
		}

		fn is_member_of(&self, authority: &ValidatorIndex, group: &ParaId) -> bool {
			self.groups.get(group).map_or(false, |g| g.contains(authority))
		}

		fn get_group_size(&self, group: &ParaId) -> Option<usize> {
			self.groups.get(group).map(|g| g.len())
		}
	}

	fn candidate(para_id: ParaId, head: u8) -> CommittedCandidateReceipt {
		let mut c = CommittedCandidateReceipt {
			descriptor: para_primitives::CandidateDescriptor {
				para_id,
				relay_parent: Hash::repeat_byte(1),
				collator: para_primitives::CollatorId::from_raw([0; 32]),
				persisted_validation_data_hash: Hash::zero(),
				pov_hash: Hash::zero(),
				erasure_root: Hash::zero(),
				signature: para_primitives::CollatorSignature::from_raw([0; 64]),
				para_head: Hash::repeat_byte(head),
				validation_code_hash: Hash::zero().into(),
			},
			commitments: CandidateCommitments::default(),
		};
		c.commitments.head_data = vec![head].into();
		c
	}

	fn sig(b: u8) -> ValidatorSignature {
		ValidatorSignature::from_raw([b; 64])
	}

	fn signed(statement: v1::Statement, sender: u32, signature: u8) -> v1::SignedStatement {
		v1::SignedStatement { statement, signature: sig(signature), sender: ValidatorIndex(sender) }
	}

	#[test]
	fn group_of_three_backs_with_two_votes() {
		let para = ParaId(7);
		let context = TestContext {
			groups: [(para, vec![ValidatorIndex(1), ValidatorIndex(2), ValidatorIndex(3)])]
				.into_iter()
				.collect(),
		};
		let mut table = Table::new(Config::default());

		let a = candidate(para, 1);
		let hash = a.hash();

		let summary = table
			.import_statement(&context, para, signed(Statement::Seconded(a.clone()), 1, 1))
			.unwrap()
			.unwrap();
		assert_eq!(summary.validity_votes, 1);
		assert_eq!(summary.group_id, para);
		assert!(table.attested_candidate(&hash, &context, 2).is_err());

		let summary = table
			.import_statement(&context, para, signed(Statement::Valid(hash), 2, 2))
			.unwrap()
			.unwrap();
		assert_eq!(summary.validity_votes, 2);

		let attested = table.attested_candidate(&hash, &context, 2).unwrap();
		assert_eq!(attested.candidate, a);
		assert_eq!(
			attested.validity_votes,
			vec![
				(ValidatorIndex(1), ValidityAttestation::Implicit(sig(1))),
				(ValidatorIndex(2), ValidityAttestation::Explicit(sig(2))),
			],
		);

		// Validator 1 attempts to second a second candidate.
		let b = candidate(para, 2);
		assert!(table
			.import_statement(&context, para, signed(Statement::Seconded(b), 1, 3))
			.unwrap()
			.is_none());

		let misbehaviors: Vec<_> = table.drain_misbehaviors().collect();
		assert_eq!(misbehaviors.len(), 1);
		assert_eq!(misbehaviors[0].0, ValidatorIndex(1));
		assert!(matches!(misbehaviors[0].1, Misbehavior::MultipleCandidates(_)));
		assert_eq!(table.drain_misbehaviors().count(), 0);

		// The original candidate keeps its backing.
		assert!(table.attested_candidate(&hash, &context, 2).is_ok());
	}

	#[test]
	fn compact_statement_from_table_statement() {
		let c = candidate(ParaId(1), 9);
		let hash = c.hash();
		assert_eq!(
			para_primitives::CompactStatement::from(&v1::Statement::Seconded(c)),
			para_primitives::CompactStatement::Seconded(hash),
		);
		assert_eq!(
			para_primitives::CompactStatement::from(&v1::Statement::Valid(hash)),
			para_primitives::CompactStatement::Valid(hash),
		);
	}
}
