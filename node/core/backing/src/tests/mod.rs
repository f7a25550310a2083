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

use super::*;
use assert_matches::assert_matches;
use futures::{future, Future};
use para_node_primitives::{BlockData, InvalidCandidate};
use para_node_subsystem::{
	errors::RuntimeApiError,
	messages::{AllMessages, StoreAvailableDataError},
	ActiveLeavesUpdate, FromOverseer, OverseerSignal,
};
use para_node_subsystem_test_helpers as test_helpers;
use para_node_subsystem_util::TimeoutExt;
use para_primitives::{
	CandidateDescriptor, GroupRotationInfo, HeadData, PersistedValidationData, ScheduledCore,
	SessionIndex, PARACHAIN_KEY_TYPE_ID,
};
use para_primitives_test_helpers::{
	dummy_collator, dummy_collator_signature, dummy_hash, dummy_validation_code,
};
use para_statement_table::v1::Misbehavior;
use sp_keystore::{testing::MemoryKeystore, Keystore};
use std::time::Duration;
use para_node_subsystem_test_helpers::mock::{new_leaf, validator_pubkey};


const ASYNC_BACKING_DISABLED_ERROR: RuntimeApiError =
	RuntimeApiError::NotSupported { runtime_api_name: "test-runtime" };

const VALIDATOR_SEEDS: [&str; 6] = ["//Alice", "//Bob", "//Charlie", "//Dave", "//Ferdie", "//One"];

fn validator_pubkeys(seeds: &[&str]) -> Vec<ValidatorId> {
	seeds.iter().map(|seed| validator_pubkey(seed)).collect()
}

pub(crate) struct TestState {
	chain_ids: Vec<ParaId>,
	keystore: KeystorePtr,
	validator_public: Vec<ValidatorId>,
	validation_data: PersistedValidationData,
	validator_groups: (Vec<Vec<ValidatorIndex>>, GroupRotationInfo),
	availability_cores: Vec<CoreState>,
	head_data: HashMap<ParaId, HeadData>,
	signing_context: SigningContext,
	relay_parent: Hash,
	minimum_backing_votes: Option<u32>,
}

impl TestState {
	fn session(&self) -> SessionIndex {
		self.signing_context.session_index
	}
}

impl Default for TestState {
	fn default() -> Self {
		let chain_a = ParaId::from(1);
		let chain_b = ParaId::from(2);

		let chain_ids = vec![chain_a, chain_b];

		let keystore: KeystorePtr = Arc::new(MemoryKeystore::new());
		// Make sure `Alice` key is in the keystore, so this mocked node will be a parachain
		// validator.
		Keystore::sr25519_generate_new(&*keystore, PARACHAIN_KEY_TYPE_ID, Some(VALIDATOR_SEEDS[0]))
			.expect("Insert key into keystore");

		let validator_public = validator_pubkeys(&VALIDATOR_SEEDS);

		let validator_groups = vec![vec![2, 0, 3, 5], vec![1], vec![4]]
			.into_iter()
			.map(|g| g.into_iter().map(ValidatorIndex).collect())
			.collect();
		let group_rotation_info =
			GroupRotationInfo { session_start_block: 0, group_rotation_frequency: 100, now: 1 };

		let availability_cores = vec![
			CoreState::Scheduled(ScheduledCore { para_id: chain_a, collator: None }),
			CoreState::Scheduled(ScheduledCore { para_id: chain_b, collator: None }),
		];

		let mut head_data = HashMap::new();
		head_data.insert(chain_a, HeadData(vec![4, 5, 6]));
		head_data.insert(chain_b, HeadData(vec![5, 6, 7]));

		let relay_parent = Hash::repeat_byte(5);

		let signing_context = SigningContext { session_index: 1, parent_hash: relay_parent };

		let validation_data = PersistedValidationData {
			parent_head: HeadData(vec![7, 8, 9]),
			relay_parent_number: 0_u32.into(),
			max_pov_size: 1024,
			relay_parent_storage_root: dummy_hash(),
		};

		Self {
			chain_ids,
			keystore,
			validator_public,
			validator_groups: (validator_groups, group_rotation_info),
			availability_cores,
			head_data,
			validation_data,
			signing_context,
			relay_parent,
			minimum_backing_votes: Some(2),
		}
	}
}

type VirtualOverseer = test_helpers::TestSubsystemContextHandle<CandidateBackingMessage>;

fn test_harness<T: Future<Output = VirtualOverseer>>(
	keystore: KeystorePtr,
	test: impl FnOnce(VirtualOverseer) -> T,
) {
	let pool = sp_core::testing::TaskExecutor::new();

	let (context, virtual_overseer) = test_helpers::make_subsystem_context(pool.clone());

	let subsystem = async move {
		if let Err(e) = super::run(context, keystore, Metrics(None)).await {
			panic!("{:?}", e);
		}
	};

	let test_fut = test(virtual_overseer);

	futures::pin_mut!(test_fut);
	futures::pin_mut!(subsystem);
	futures::executor::block_on(future::join(
		async move {
			let mut virtual_overseer = test_fut.await;
			virtual_overseer.send(FromOverseer::Signal(OverseerSignal::Conclude)).await;
		},
		subsystem,
	));
}

fn make_erasure_root(test: &TestState, pov: PoV, validation_data: PersistedValidationData) -> Hash {
	let available_data = AvailableData { validation_data, pov: Arc::new(pov) };

	let chunks =
		para_erasure_coding::obtain_chunks_v1(test.validator_public.len(), &available_data)
			.unwrap();
	para_erasure_coding::branches(&chunks).root()
}

/// Sign a statement on behalf of the validator at `index`, with a keystore of its own.
fn sign_as(
	test_state: &TestState,
	index: usize,
	statement: StatementWithPVD,
) -> SignedFullStatementWithPVD {
	let keystore: KeystorePtr = Arc::new(MemoryKeystore::new());
	let public =
		Keystore::sr25519_generate_new(&*keystore, PARACHAIN_KEY_TYPE_ID, Some(VALIDATOR_SEEDS[index]))
			.expect("Insert key into keystore");

	SignedFullStatementWithPVD::sign(
		&keystore,
		statement,
		&test_state.signing_context,
		ValidatorIndex(index as u32),
		&public,
	)
	.ok()
	.flatten()
	.expect("should be signed")
}

#[derive(Default)]
pub(crate) struct TestCandidateBuilder {
	para_id: ParaId,
	head_data: HeadData,
	pov_hash: Hash,
	relay_parent: Hash,
	erasure_root: Hash,
	persisted_validation_data_hash: Hash,
	validation_code: Vec<u8>,
}

impl TestCandidateBuilder {
	fn build(self) -> CommittedCandidateReceipt {
		CommittedCandidateReceipt {
			descriptor: CandidateDescriptor {
				para_id: self.para_id,
				pov_hash: self.pov_hash,
				relay_parent: self.relay_parent,
				erasure_root: self.erasure_root,
				collator: dummy_collator(),
				signature: dummy_collator_signature(),
				para_head: self.head_data.hash(),
				validation_code_hash: ValidationCode(self.validation_code).hash(),
				persisted_validation_data_hash: self.persisted_validation_data_hash,
			},
			commitments: CandidateCommitments {
				head_data: self.head_data,
				upward_messages: vec![],
				horizontal_messages: vec![],
				new_validation_code: None,
				processed_downward_messages: 0,
				hrmp_watermark: 0_u32,
			},
		}
	}
}

// Tests that the subsystem performs actions that are required on startup.
async fn test_startup(virtual_overseer: &mut VirtualOverseer, test_state: &TestState) {
	// Start work on some new parent.
	virtual_overseer
		.send(FromOverseer::Signal(OverseerSignal::ActiveLeaves(ActiveLeavesUpdate::start_work(
			new_leaf(test_state.relay_parent, 1),
		))))
		.await;

	assert_matches!(
		virtual_overseer.recv().await,
		AllMessages::RuntimeApi(
			RuntimeApiMessage::Request(parent, RuntimeApiRequest::AsyncBackingParams(tx))
		) if parent == test_state.relay_parent => {
			tx.send(Err(ASYNC_BACKING_DISABLED_ERROR)).unwrap();
		}
	);

	// Check that subsystem job issues a request for the session index for child.
	assert_matches!(
		virtual_overseer.recv().await,
		AllMessages::RuntimeApi(
			RuntimeApiMessage::Request(parent, RuntimeApiRequest::SessionIndexForChild(tx))
		) if parent == test_state.relay_parent => {
			tx.send(Ok(test_state.session())).unwrap();
		}
	);

	// Check that subsystem job issues a request for a validator set.
	assert_matches!(
		virtual_overseer.recv().await,
		AllMessages::RuntimeApi(
			RuntimeApiMessage::Request(parent, RuntimeApiRequest::Validators(tx))
		) if parent == test_state.relay_parent => {
			tx.send(Ok(test_state.validator_public.clone())).unwrap();
		}
	);

	// Check that subsystem job issues a request for the validator groups.
	assert_matches!(
		virtual_overseer.recv().await,
		AllMessages::RuntimeApi(
			RuntimeApiMessage::Request(parent, RuntimeApiRequest::ValidatorGroups(tx))
		) if parent == test_state.relay_parent => {
			tx.send(Ok(test_state.validator_groups.clone())).unwrap();
		}
	);

	// Check that subsystem job issues a request for the availability cores.
	assert_matches!(
		virtual_overseer.recv().await,
		AllMessages::RuntimeApi(
			RuntimeApiMessage::Request(parent, RuntimeApiRequest::AvailabilityCores(tx))
		) if parent == test_state.relay_parent => {
			tx.send(Ok(test_state.availability_cores.clone())).unwrap();
		}
	);

	assert_matches!(
		virtual_overseer.recv().await,
		AllMessages::RuntimeApi(
			RuntimeApiMessage::Request(parent, RuntimeApiRequest::MinimumBackingVotes(session, tx))
		) if parent == test_state.relay_parent && session == test_state.session() => {
			match test_state.minimum_backing_votes {
				Some(votes) => tx.send(Ok(votes)).unwrap(),
				None => tx.send(Err(RuntimeApiError::NotSupported {
					runtime_api_name: "minimum_backing_votes",
				})).unwrap(),
			}
		}
	);
}

async fn assert_validation_requests(
	virtual_overseer: &mut VirtualOverseer,
	validation_code: ValidationCode,
) {
	assert_matches!(
		virtual_overseer.recv().await,
		AllMessages::RuntimeApi(
			RuntimeApiMessage::Request(_, RuntimeApiRequest::ValidationCodeByHash(hash, tx))
		) if hash == validation_code.hash() => {
			tx.send(Ok(Some(validation_code))).unwrap();
		}
	);
}

async fn assert_validate_from_exhaustive(
	virtual_overseer: &mut VirtualOverseer,
	candidate: &CommittedCandidateReceipt,
	pov: &PoV,
	pvd: &PersistedValidationData,
) {
	assert_matches!(
		virtual_overseer.recv().await,
		AllMessages::CandidateValidation(
			CandidateValidationMessage::ValidateFromExhaustive {
				validation_data,
				candidate_receipt,
				pov: received_pov,
				response_sender,
				..
			}
		) if &validation_data == pvd &&
			&*received_pov == pov &&
			candidate_receipt.descriptor == candidate.descriptor &&
			candidate_receipt.commitments_hash == candidate.commitments.hash() => {
			response_sender.send(Ok(ValidationResult::Valid(
				candidate.commitments.clone(),
				pvd.clone(),
			))).unwrap();
		}
	);
}

async fn assert_store_available_data(
	virtual_overseer: &mut VirtualOverseer,
	candidate: &CommittedCandidateReceipt,
) {
	assert_matches!(
		virtual_overseer.recv().await,
		AllMessages::AvailabilityStore(
			AvailabilityStoreMessage::StoreAvailableData { candidate_hash, expected_erasure_root, tx, .. }
		) if candidate_hash == candidate.hash() => {
			assert_eq!(expected_erasure_root, candidate.descriptor.erasure_root);
			tx.send(Ok(())).unwrap();
		}
	);
}

fn make_candidate(
	test_state: &TestState,
	para_id: ParaId,
	pov: &PoV,
	pvd: &PersistedValidationData,
) -> CommittedCandidateReceipt {
	TestCandidateBuilder {
		para_id,
		relay_parent: test_state.relay_parent,
		pov_hash: pov.hash(),
		head_data: test_state.head_data[&para_id].clone(),
		erasure_root: make_erasure_root(test_state, pov.clone(), pvd.clone()),
		persisted_validation_data_hash: pvd.hash(),
		validation_code: dummy_validation_code().0,
	}
	.build()
}

// Test that a `CandidateBackingMessage::Second` issues validation work
// and in case validation is successful issues a `StatementDistributionMessage`.
#[test]
fn backing_second_works() {
	let test_state = TestState::default();
	test_harness(test_state.keystore.clone(), |mut virtual_overseer| async move {
		test_startup(&mut virtual_overseer, &test_state).await;

		let pov = PoV { block_data: BlockData(vec![42, 43, 44]) };
		let pvd = test_state.validation_data.clone();
		let candidate = make_candidate(&test_state, test_state.chain_ids[0], &pov, &pvd);

		let second = CandidateBackingMessage::Second(
			test_state.relay_parent,
			candidate.to_plain(),
			pvd.clone(),
			pov.clone(),
		);

		virtual_overseer.send(FromOverseer::Communication { msg: second }).await;

		assert_validation_requests(&mut virtual_overseer, dummy_validation_code()).await;
		assert_validate_from_exhaustive(&mut virtual_overseer, &candidate, &pov, &pvd).await;
		assert_store_available_data(&mut virtual_overseer, &candidate).await;

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::StatementDistribution(
				StatementDistributionMessage::Share(
					parent_hash,
					signed_statement,
				)
			) if parent_hash == test_state.relay_parent => {
				assert_eq!(signed_statement.validator_index(), ValidatorIndex(0));
				assert_matches!(
					signed_statement.payload(),
					StatementWithPVD::Seconded(c, p) if c == &candidate && p == &pvd
				);
			}
		);

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::CollatorProtocol(CollatorProtocolMessage::Seconded(hash, statement)) => {
				assert_eq!(test_state.relay_parent, hash);
				assert_matches!(statement.payload(), para_node_primitives::Statement::Seconded(_));
			}
		);

		virtual_overseer
			.send(FromOverseer::Signal(OverseerSignal::ActiveLeaves(
				ActiveLeavesUpdate::stop_work(test_state.relay_parent),
			)))
			.await;
		virtual_overseer
	});
}

// Test that the candidate reaches quorum successfully.
#[test]
fn backing_works() {
	let test_state = TestState::default();
	test_harness(test_state.keystore.clone(), |mut virtual_overseer| async move {
		test_startup(&mut virtual_overseer, &test_state).await;

		let pov = PoV { block_data: BlockData(vec![1, 2, 3]) };
		let pvd = test_state.validation_data.clone();
		let candidate_a = make_candidate(&test_state, test_state.chain_ids[0], &pov, &pvd);
		let candidate_a_hash = candidate_a.hash();

		let signed_a = sign_as(
			&test_state,
			2,
			StatementWithPVD::Seconded(candidate_a.clone(), pvd.clone()),
		);
		let signed_b = sign_as(&test_state, 5, StatementWithPVD::Valid(candidate_a_hash));

		let statement =
			CandidateBackingMessage::Statement(test_state.relay_parent, signed_a.clone());

		virtual_overseer.send(FromOverseer::Communication { msg: statement }).await;

		assert_validation_requests(&mut virtual_overseer, dummy_validation_code()).await;

		// Sending a `Seconded` statement from a group member kicks off a PoV fetch from
		// that validator.
		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::AvailabilityDistribution(
				AvailabilityDistributionMessage::FetchPoV {
					relay_parent,
					from_validator,
					candidate_hash,
					pov_hash,
					tx,
					..
				}
			) if relay_parent == test_state.relay_parent && candidate_hash == candidate_a_hash => {
				assert_eq!(from_validator, ValidatorIndex(2));
				assert_eq!(pov_hash, pov.hash());
				tx.send(pov.clone()).unwrap();
			}
		);

		assert_validate_from_exhaustive(&mut virtual_overseer, &candidate_a, &pov, &pvd).await;
		assert_store_available_data(&mut virtual_overseer, &candidate_a).await;

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::StatementDistribution(
				StatementDistributionMessage::Share(hash, signed)
			) if hash == test_state.relay_parent => {
				assert_eq!(signed.payload(), &StatementWithPVD::Valid(candidate_a_hash));
			}
		);

		// Two votes out of a group of four reach the threshold.
		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::Provisioner(
				ProvisionerMessage::ProvisionableData(
					_,
					ProvisionableData::BackedCandidate(candidate_receipt)
				)
			) => {
				assert_eq!(candidate_receipt, candidate_a.to_plain());
			}
		);

		let statement =
			CandidateBackingMessage::Statement(test_state.relay_parent, signed_b.clone());

		virtual_overseer.send(FromOverseer::Communication { msg: statement }).await;

		let (tx, rx) = oneshot::channel();
		let msg = CandidateBackingMessage::GetBackedCandidates(
			vec![(candidate_a_hash, test_state.relay_parent)],
			tx,
		);

		virtual_overseer.send(FromOverseer::Communication { msg }).await;

		let candidates = rx.await.unwrap();
		assert_eq!(1, candidates.len());
		assert_eq!(candidates[0].validity_votes.len(), 3);

		// The group is `[2, 0, 3, 5]`, votes must be ordered by position in the group.
		assert_eq!(
			candidates[0].validity_votes,
			vec![
				ValidityAttestation::Implicit(signed_a.signature().clone()),
				candidates[0].validity_votes[1].clone(),
				ValidityAttestation::Explicit(signed_b.signature().clone()),
			],
		);
		assert_matches!(candidates[0].validity_votes[1], ValidityAttestation::Explicit(_));

		let mut expected_bitfield: BitVec<u8, BitOrderLsb0> = BitVec::new();
		expected_bitfield.resize(4, false);
		expected_bitfield.set(0, true);
		expected_bitfield.set(1, true);
		expected_bitfield.set(3, true);
		assert_eq!(candidates[0].validator_indices, expected_bitfield);

		virtual_overseer
			.send(FromOverseer::Signal(OverseerSignal::ActiveLeaves(
				ActiveLeavesUpdate::stop_work(test_state.relay_parent),
			)))
			.await;
		virtual_overseer
	});
}

// Backing is held back until `minimum_backing_votes` votes are collected.
#[test]
fn backing_respects_minimum_backing_votes() {
	let test_state = TestState { minimum_backing_votes: Some(3), ..Default::default() };
	test_harness(test_state.keystore.clone(), |mut virtual_overseer| async move {
		test_startup(&mut virtual_overseer, &test_state).await;

		let pov = PoV { block_data: BlockData(vec![1, 2, 3]) };
		let pvd = test_state.validation_data.clone();
		let candidate_a = make_candidate(&test_state, test_state.chain_ids[0], &pov, &pvd);
		let candidate_a_hash = candidate_a.hash();

		let signed_a = sign_as(
			&test_state,
			2,
			StatementWithPVD::Seconded(candidate_a.clone(), pvd.clone()),
		);

		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::Statement(test_state.relay_parent, signed_a),
			})
			.await;

		assert_validation_requests(&mut virtual_overseer, dummy_validation_code()).await;
		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::AvailabilityDistribution(
				AvailabilityDistributionMessage::FetchPoV { tx, .. }
			) => {
				tx.send(pov.clone()).unwrap();
			}
		);
		assert_validate_from_exhaustive(&mut virtual_overseer, &candidate_a, &pov, &pvd).await;
		assert_store_available_data(&mut virtual_overseer, &candidate_a).await;

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::StatementDistribution(StatementDistributionMessage::Share(..))
		);

		let (tx, rx) = oneshot::channel();
		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::GetBackedCandidates(
					vec![(candidate_a_hash, test_state.relay_parent)],
					tx,
				),
			})
			.await;
		assert!(rx.await.unwrap().is_empty());

		let signed_c = sign_as(&test_state, 3, StatementWithPVD::Valid(candidate_a_hash));
		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::Statement(test_state.relay_parent, signed_c),
			})
			.await;

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::Provisioner(
				ProvisionerMessage::ProvisionableData(
					_,
					ProvisionableData::BackedCandidate(candidate_receipt)
				)
			) => {
				assert_eq!(candidate_receipt.hash(), candidate_a_hash);
			}
		);

		virtual_overseer
	});
}

// A validator seconding two different candidates for the same para is reported.
#[test]
fn backing_misbehavior_works() {
	let test_state = TestState::default();
	test_harness(test_state.keystore.clone(), |mut virtual_overseer| async move {
		test_startup(&mut virtual_overseer, &test_state).await;

		// `chain_b` is assigned to a group consisting of validator 1 only, so no validation
		// work is done on our side.
		let para_id = test_state.chain_ids[1];
		let pvd = test_state.validation_data.clone();
		let pov_a = PoV { block_data: BlockData(vec![1, 2, 3]) };
		let pov_b = PoV { block_data: BlockData(vec![4, 5, 6]) };
		let candidate_a = make_candidate(&test_state, para_id, &pov_a, &pvd);
		let candidate_b = make_candidate(&test_state, para_id, &pov_b, &pvd);

		let seconded_a =
			sign_as(&test_state, 1, StatementWithPVD::Seconded(candidate_a.clone(), pvd.clone()));
		let seconded_b =
			sign_as(&test_state, 1, StatementWithPVD::Seconded(candidate_b.clone(), pvd.clone()));

		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::Statement(test_state.relay_parent, seconded_a),
			})
			.await;

		// A single vote backs a candidate in a group of one.
		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::Provisioner(
				ProvisionerMessage::ProvisionableData(
					_,
					ProvisionableData::BackedCandidate(candidate_receipt)
				)
			) => {
				assert_eq!(candidate_receipt, candidate_a.to_plain());
			}
		);

		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::Statement(test_state.relay_parent, seconded_b),
			})
			.await;

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::Provisioner(
				ProvisionerMessage::ProvisionableData(
					relay_parent,
					ProvisionableData::MisbehaviorReport(_, validator_index, misbehavior)
				)
			) if relay_parent == test_state.relay_parent => {
				assert_eq!(validator_index, ValidatorIndex(1));
				assert_matches!(misbehavior, Misbehavior::MultipleCandidates(_));
			}
		);

		virtual_overseer
	});
}

// `GetBackedCandidates` answers in request order and skips unknown candidates.
#[test]
fn get_backed_candidates_preserves_order() {
	let test_state = TestState::default();
	test_harness(test_state.keystore.clone(), |mut virtual_overseer| async move {
		test_startup(&mut virtual_overseer, &test_state).await;

		let pvd = test_state.validation_data.clone();
		let para_id = test_state.chain_ids[1];
		let pov_a = PoV { block_data: BlockData(vec![1]) };
		let candidate_a = make_candidate(&test_state, para_id, &pov_a, &pvd);

		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::Statement(
					test_state.relay_parent,
					sign_as(&test_state, 1, StatementWithPVD::Seconded(candidate_a.clone(), pvd.clone())),
				),
			})
			.await;

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::Provisioner(ProvisionerMessage::ProvisionableData(
				_,
				ProvisionableData::BackedCandidate(_)
			))
		);

		let unknown_hash = CandidateHash(Hash::repeat_byte(42));
		let unknown_relay_parent = Hash::repeat_byte(43);

		let (tx, rx) = oneshot::channel();
		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::GetBackedCandidates(
					vec![
						(unknown_hash, test_state.relay_parent),
						(candidate_a.hash(), unknown_relay_parent),
						(candidate_a.hash(), test_state.relay_parent),
					],
					tx,
				),
			})
			.await;

		let backed = rx.await.unwrap();
		assert_eq!(backed.len(), 1);
		assert_eq!(backed[0].hash(), candidate_a.hash());
		assert_eq!(backed[0].validity_votes.len(), 1);

		virtual_overseer
	});
}

// `Second` requests that can't be fulfilled don't produce any messages.
#[test]
fn second_rejects_wrong_pvd_and_foreign_para() {
	let test_state = TestState::default();
	test_harness(test_state.keystore.clone(), |mut virtual_overseer| async move {
		test_startup(&mut virtual_overseer, &test_state).await;

		let pov = PoV { block_data: BlockData(vec![1, 2, 3]) };
		let pvd = test_state.validation_data.clone();

		let candidate_a = make_candidate(&test_state, test_state.chain_ids[0], &pov, &pvd);
		let mut wrong_pvd = pvd.clone();
		wrong_pvd.max_pov_size += 1;

		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::Second(
					test_state.relay_parent,
					candidate_a.to_plain(),
					wrong_pvd,
					pov.clone(),
				),
			})
			.await;

		// Para outside of our assignment.
		let candidate_b = make_candidate(&test_state, test_state.chain_ids[1], &pov, &pvd);
		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::Second(
					test_state.relay_parent,
					candidate_b.to_plain(),
					pvd.clone(),
					pov.clone(),
				),
			})
			.await;

		// Unknown relay parent.
		let mut candidate_c = candidate_a.clone();
		candidate_c.descriptor.relay_parent = Hash::repeat_byte(77);
		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::Second(
					Hash::repeat_byte(77),
					candidate_c.to_plain(),
					pvd.clone(),
					pov.clone(),
				),
			})
			.await;

		// The first message produced is for a valid request.
		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::Second(
					test_state.relay_parent,
					candidate_a.to_plain(),
					pvd.clone(),
					pov.clone(),
				),
			})
			.await;

		assert_validation_requests(&mut virtual_overseer, dummy_validation_code()).await;
		assert_validate_from_exhaustive(&mut virtual_overseer, &candidate_a, &pov, &pvd).await;
		assert_store_available_data(&mut virtual_overseer, &candidate_a).await;

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::StatementDistribution(StatementDistributionMessage::Share(hash, _))
				if hash == test_state.relay_parent
		);
		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::CollatorProtocol(CollatorProtocolMessage::Seconded(..))
		);

		virtual_overseer
	});
}

// Candidates that fail validation are reported to the collator protocol.
#[test]
fn backing_second_invalid_reports_collator() {
	let test_state = TestState::default();
	test_harness(test_state.keystore.clone(), |mut virtual_overseer| async move {
		test_startup(&mut virtual_overseer, &test_state).await;

		let pov = PoV { block_data: BlockData(vec![1, 2, 3]) };
		let pvd = test_state.validation_data.clone();
		let candidate = make_candidate(&test_state, test_state.chain_ids[0], &pov, &pvd);

		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::Second(
					test_state.relay_parent,
					candidate.to_plain(),
					pvd.clone(),
					pov.clone(),
				),
			})
			.await;

		assert_validation_requests(&mut virtual_overseer, dummy_validation_code()).await;

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::CandidateValidation(
				CandidateValidationMessage::ValidateFromExhaustive { response_sender, .. }
			) => {
				response_sender.send(Ok(ValidationResult::Invalid(InvalidCandidate::BadReturn))).unwrap();
			}
		);

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::CollatorProtocol(
				CollatorProtocolMessage::Invalid(parent_hash, c)
			) if parent_hash == test_state.relay_parent && c == candidate.to_plain()
		);

		virtual_overseer
	});
}

// A candidate whose erasure root is rejected by the availability store is invalid.
#[test]
fn invalid_erasure_root_reports_collator() {
	let test_state = TestState::default();
	test_harness(test_state.keystore.clone(), |mut virtual_overseer| async move {
		test_startup(&mut virtual_overseer, &test_state).await;

		let pov = PoV { block_data: BlockData(vec![1, 2, 3]) };
		let pvd = test_state.validation_data.clone();
		let mut candidate = make_candidate(&test_state, test_state.chain_ids[0], &pov, &pvd);
		candidate.descriptor.erasure_root = Hash::repeat_byte(1);

		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::Second(
					test_state.relay_parent,
					candidate.to_plain(),
					pvd.clone(),
					pov.clone(),
				),
			})
			.await;

		assert_validation_requests(&mut virtual_overseer, dummy_validation_code()).await;
		assert_validate_from_exhaustive(&mut virtual_overseer, &candidate, &pov, &pvd).await;

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::AvailabilityStore(
				AvailabilityStoreMessage::StoreAvailableData { tx, .. }
			) => {
				tx.send(Err(StoreAvailableDataError::InvalidErasureRoot)).unwrap();
			}
		);

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::CollatorProtocol(CollatorProtocolMessage::Invalid(_, c))
				if c == candidate.to_plain()
		);

		virtual_overseer
	});
}

// A second `Second` for a candidate which is still being validated does not start another
// validation.
#[test]
fn concurrent_second_is_ignored() {
	let test_state = TestState::default();
	test_harness(test_state.keystore.clone(), |mut virtual_overseer| async move {
		test_startup(&mut virtual_overseer, &test_state).await;

		let pov = PoV { block_data: BlockData(vec![4, 5, 6]) };
		let pvd = test_state.validation_data.clone();
		let candidate = make_candidate(&test_state, test_state.chain_ids[0], &pov, &pvd);
		let second = || CandidateBackingMessage::Second(
			test_state.relay_parent,
			candidate.to_plain(),
			pvd.clone(),
			pov.clone(),
		);

		virtual_overseer.send(FromOverseer::Communication { msg: second() }).await;

		let code_tx = assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::RuntimeApi(
				RuntimeApiMessage::Request(_, RuntimeApiRequest::ValidationCodeByHash(_, tx))
			) => tx
		);

		virtual_overseer.send(FromOverseer::Communication { msg: second() }).await;

		// The subsystem has handled the duplicate once it answers this.
		let (tx, rx) = oneshot::channel();
		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::GetBackedCandidates(
					vec![(candidate.hash(), test_state.relay_parent)],
					tx,
				),
			})
			.await;
		assert!(rx.await.unwrap().is_empty());

		code_tx.send(Ok(Some(dummy_validation_code()))).unwrap();
		assert_validate_from_exhaustive(&mut virtual_overseer, &candidate, &pov, &pvd).await;
		assert_store_available_data(&mut virtual_overseer, &candidate).await;

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::StatementDistribution(StatementDistributionMessage::Share(_, statement)) => {
				assert_matches!(statement.payload(), StatementWithPVD::Seconded(c, _) if c == &candidate);
			}
		);
		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::CollatorProtocol(CollatorProtocolMessage::Seconded(..))
		);

		virtual_overseer
	});
}

// When validation can't complete, the candidate may be submitted for seconding again.
#[test]
fn aborted_validation_allows_second_again() {
	let test_state = TestState::default();
	test_harness(test_state.keystore.clone(), |mut virtual_overseer| async move {
		test_startup(&mut virtual_overseer, &test_state).await;

		let pov = PoV { block_data: BlockData(vec![7, 8, 9]) };
		let pvd = test_state.validation_data.clone();
		let candidate = make_candidate(&test_state, test_state.chain_ids[0], &pov, &pvd);
		let second = || CandidateBackingMessage::Second(
			test_state.relay_parent,
			candidate.to_plain(),
			pvd.clone(),
			pov.clone(),
		);

		virtual_overseer.send(FromOverseer::Communication { msg: second() }).await;

		assert_validation_requests(&mut virtual_overseer, dummy_validation_code()).await;

		// Dropping the response channel fails the background validation.
		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::CandidateValidation(
				CandidateValidationMessage::ValidateFromExhaustive { response_sender, .. }
			) => drop(response_sender)
		);

		// The abort races with our next message, so repeat until a new validation starts.
		let mut restarted = None;
		for _ in 0..50 {
			virtual_overseer.send(FromOverseer::Communication { msg: second() }).await;
			if let Some(msg) = virtual_overseer.recv().timeout(Duration::from_millis(100)).await {
				restarted = Some(msg);
				break
			}
		}

		assert_matches!(
			restarted,
			Some(AllMessages::RuntimeApi(
				RuntimeApiMessage::Request(_, RuntimeApiRequest::ValidationCodeByHash(hash, tx))
			)) if hash == dummy_validation_code().hash() => {
				tx.send(Ok(Some(dummy_validation_code()))).unwrap();
			}
		);

		assert_validate_from_exhaustive(&mut virtual_overseer, &candidate, &pov, &pvd).await;
		assert_store_available_data(&mut virtual_overseer, &candidate).await;

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::StatementDistribution(StatementDistributionMessage::Share(..))
		);
		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::CollatorProtocol(CollatorProtocolMessage::Seconded(..))
		);

		virtual_overseer
	});
}

// If the seconding validator doesn't provide the PoV, it is fetched from another validator
// which has issued a `Valid` statement in the meantime.
#[test]
fn retry_works() {
	// Relies on the legacy threshold of two votes.
	let test_state = TestState { minimum_backing_votes: None, ..Default::default() };
	test_harness(test_state.keystore.clone(), |mut virtual_overseer| async move {
		test_startup(&mut virtual_overseer, &test_state).await;

		let pov = PoV { block_data: BlockData(vec![42, 43, 44]) };
		let pvd = test_state.validation_data.clone();
		let candidate = make_candidate(&test_state, test_state.chain_ids[0], &pov, &pvd);
		let candidate_hash = candidate.hash();

		let signed_a =
			sign_as(&test_state, 2, StatementWithPVD::Seconded(candidate.clone(), pvd.clone()));
		let signed_b = sign_as(&test_state, 3, StatementWithPVD::Valid(candidate_hash));

		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::Statement(test_state.relay_parent, signed_a),
			})
			.await;

		assert_validation_requests(&mut virtual_overseer, dummy_validation_code()).await;

		let first_fetch_tx = assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::AvailabilityDistribution(
				AvailabilityDistributionMessage::FetchPoV { from_validator, tx, .. }
			) => {
				assert_eq!(from_validator, ValidatorIndex(2));
				tx
			}
		);

		// Another backer arrives while the fetch is pending.
		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::Statement(test_state.relay_parent, signed_b),
			})
			.await;

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::Provisioner(ProvisionerMessage::ProvisionableData(
				_,
				ProvisionableData::BackedCandidate(c)
			)) if c.hash() == candidate_hash
		);

		// The first backer fails to provide the PoV.
		drop(first_fetch_tx);

		assert_validation_requests(&mut virtual_overseer, dummy_validation_code()).await;
		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::AvailabilityDistribution(
				AvailabilityDistributionMessage::FetchPoV { from_validator, tx, .. }
			) => {
				assert_eq!(from_validator, ValidatorIndex(3));
				tx.send(pov.clone()).unwrap();
			}
		);

		assert_validate_from_exhaustive(&mut virtual_overseer, &candidate, &pov, &pvd).await;
		assert_store_available_data(&mut virtual_overseer, &candidate).await;

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::StatementDistribution(StatementDistributionMessage::Share(_, signed)) => {
				assert_eq!(signed.payload(), &StatementWithPVD::Valid(candidate_hash));
				assert_eq!(signed.validator_index(), ValidatorIndex(0));
			}
		);

		virtual_overseer
	});
}

// Deactivating a leaf drops all state for it.
#[test]
fn relay_parent_out_of_view_is_forgotten() {
	let test_state = TestState::default();
	test_harness(test_state.keystore.clone(), |mut virtual_overseer| async move {
		test_startup(&mut virtual_overseer, &test_state).await;

		let pvd = test_state.validation_data.clone();
		let pov = PoV { block_data: BlockData(vec![1]) };
		let candidate = make_candidate(&test_state, test_state.chain_ids[1], &pov, &pvd);

		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::Statement(
					test_state.relay_parent,
					sign_as(&test_state, 1, StatementWithPVD::Seconded(candidate.clone(), pvd.clone())),
				),
			})
			.await;

		assert_matches!(
			virtual_overseer.recv().await,
			AllMessages::Provisioner(ProvisionerMessage::ProvisionableData(
				_,
				ProvisionableData::BackedCandidate(_)
			))
		);

		virtual_overseer
			.send(FromOverseer::Signal(OverseerSignal::ActiveLeaves(
				ActiveLeavesUpdate::stop_work(test_state.relay_parent),
			)))
			.await;

		let (tx, rx) = oneshot::channel();
		virtual_overseer
			.send(FromOverseer::Communication {
				msg: CandidateBackingMessage::GetBackedCandidates(
					vec![(candidate.hash(), test_state.relay_parent)],
					tx,
				),
			})
			.await;
		assert!(rx.await.unwrap().is_empty());

		virtual_overseer
	});
}

#[test]
fn table_attested_to_backed_orders_votes_by_group_position() {
	let test_state = TestState::default();
	let para_id = test_state.chain_ids[0];
	let pvd = test_state.validation_data.clone();
	let pov = PoV { block_data: BlockData(vec![9]) };
	let candidate = make_candidate(&test_state, para_id, &pov, &pvd);

	let (groups, _) = test_state.validator_groups.clone();
	let table_context = TableContext {
		validator: None,
		groups: vec![(para_id, groups[0].clone())].into_iter().collect(),
		validators: test_state.validator_public.clone(),
	};

	// Signatures are randomized, so each one is produced once.
	let signature = |index: usize| {
		sign_as(&test_state, index, StatementWithPVD::Valid(candidate.hash())).signature().clone()
	};
	let (signature_2, signature_5) = (signature(2), signature(5));

	let attested = TableAttestedCandidate {
		group_id: para_id,
		candidate: candidate.clone(),
		validity_votes: vec![
			(ValidatorIndex(5), TableValidityAttestation::Explicit(signature_5.clone())),
			(ValidatorIndex(2), TableValidityAttestation::Implicit(signature_2.clone())),
		],
	};

	let backed = table_attested_to_backed(attested, &table_context).unwrap();
	assert_eq!(
		backed.validity_votes,
		vec![
			ValidityAttestation::Implicit(signature_2),
			ValidityAttestation::Explicit(signature_5),
		],
	);
	assert_eq!(backed.validator_indices.iter().by_vals().collect::<Vec<_>>(), vec![true, false, false, true]);

	// A vote from outside the group can't be turned into a backed candidate.
	let signature_1 = signature(1);
	let attested = TableAttestedCandidate {
		group_id: para_id,
		candidate,
		validity_votes: vec![(ValidatorIndex(1), TableValidityAttestation::Explicit(signature_1))],
	};
	assert!(table_attested_to_backed(attested, &table_context).is_none());
}

#[test]
fn candidate_is_noted_backed_only_after_conversion() {
	let test_state = TestState::default();
	let para_id = test_state.chain_ids[0];
	let pvd = test_state.validation_data.clone();
	let pov = PoV { block_data: BlockData(vec![10]) };
	let candidate = make_candidate(&test_state, para_id, &pov, &pvd);
	let candidate_hash = candidate.hash();

	let (groups, _) = test_state.validator_groups.clone();
	let table_context = TableContext {
		validator: None,
		groups: vec![(para_id, groups[0].clone())].into_iter().collect(),
		validators: test_state.validator_public.clone(),
	};

	let signature_1 =
		sign_as(&test_state, 1, StatementWithPVD::Valid(candidate_hash)).signature().clone();
	let signature_2 =
		sign_as(&test_state, 2, StatementWithPVD::Valid(candidate_hash)).signature().clone();

	let mut backed = HashSet::new();

	// Validator 1 isn't part of the group, so there is nothing to back yet.
	let outside_group = TableAttestedCandidate {
		group_id: para_id,
		candidate: candidate.clone(),
		validity_votes: vec![(ValidatorIndex(1), TableValidityAttestation::Explicit(signature_1))],
	};
	assert!(note_newly_backed(&mut backed, outside_group, &table_context).is_none());
	assert!(backed.is_empty());

	let attested = TableAttestedCandidate {
		group_id: para_id,
		candidate,
		validity_votes: vec![(ValidatorIndex(2), TableValidityAttestation::Implicit(signature_2))],
	};
	let backed_candidate =
		note_newly_backed(&mut backed, attested.clone(), &table_context).unwrap();
	assert_eq!(backed_candidate.hash(), candidate_hash);
	assert!(backed.contains(&candidate_hash));

	// The candidate is only reported once.
	assert!(note_newly_backed(&mut backed, attested, &table_context).is_none());
}
