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


//! Mock keystores and leaves for subsystem tests.

use std::sync::Arc;

use para_node_subsystem::ActivatedLeaf;
use para_primitives::{BlockNumber, Hash, ValidatorId, PARACHAIN_KEY_TYPE_ID};
use sp_keystore::{testing::MemoryKeystore, Keystore, KeystorePtr};

/// Get mock keystore with `Ferdie` key.
pub fn make_ferdie_keystore() -> KeystorePtr {
	let keystore: KeystorePtr = Arc::new(MemoryKeystore::new());
	Keystore::sr25519_generate_new(&*keystore, PARACHAIN_KEY_TYPE_ID, Some("//Ferdie"))
		.expect("Insert key into keystore");
	keystore
}

/// Derive the public validator key for a development seed such as `//Alice`.
pub fn validator_pubkey(seed: &str) -> ValidatorId {
	let keystore = MemoryKeystore::new();
	Keystore::sr25519_generate_new(&keystore, PARACHAIN_KEY_TYPE_ID, Some(seed))
		.expect("Insert key into keystore")
}

/// Create a new leaf with the given hash and number.
pub fn new_leaf(hash: Hash, number: BlockNumber) -> ActivatedLeaf {
	ActivatedLeaf { hash, number }
}
