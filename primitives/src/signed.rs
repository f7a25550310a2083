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

//! Payloads signed by a validator within a [`SigningContext`].

use parity_scale_codec::{Decode, Encode};
use sp_core::{sr25519, Pair as _};
use sp_keystore::{Error as KeystoreError, KeystorePtr};
use std::marker::PhantomData;

use crate::{SigningContext, ValidatorId, ValidatorIndex, ValidatorSignature, PARACHAIN_KEY_TYPE_ID};

/// A signed type which encapsulates the common desire to sign some data and validate a signature.
///
/// Note that the internal fields are not public; they are all accessable by immutable getters.
/// This reduces the chance that they are accidentally mutated, invalidating the signature.
///
/// `RealPayload` is the type which is actually signed; `Payload` is the type kept in memory,
/// which encodes as `RealPayload` via [`EncodeAs`].
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct Signed<Payload, RealPayload = Payload> {
	/// The payload is part of the signed data. The rest is the signing context,
	/// which is known both at signing and at validation.
	payload: Payload,
	/// The index of the validator signing this statement.
	validator_index: ValidatorIndex,
	/// The signature by the validator of the signed payload.
	signature: ValidatorSignature,
	/// This ensures the real payload is tracked at the typesystem level.
	real_payload: PhantomData<RealPayload>,
}

impl<Payload: EncodeAs<RealPayload>, RealPayload: Encode> Signed<Payload, RealPayload> {
	fn payload_data(payload: &Payload, context: &SigningContext) -> Vec<u8> {
		// equivalent to (real_payload, context).encode()
		let mut out = payload.encode_as();
		out.extend(context.encode());
		out
	}

	/// Used to create a `Signed` from already existing parts.
	///
	/// Returns `None` if the signature does not check out.
	pub fn new(
		payload: Payload,
		validator_index: ValidatorIndex,
		signature: ValidatorSignature,
		context: &SigningContext,
		key: &ValidatorId,
	) -> Option<Self> {
		let s = Self { payload, validator_index, signature, real_payload: PhantomData };

		s.check_signature(context, key).ok()?;

		Some(s)
	}

	/// Create a `Signed` from parts without checking the signature.
	pub fn new_unchecked(
		payload: Payload,
		validator_index: ValidatorIndex,
		signature: ValidatorSignature,
	) -> Self {
		Self { payload, validator_index, signature, real_payload: PhantomData }
	}

	/// Sign this payload with the given context and key, storing the validator index.
	///
	/// Returns `Ok(None)` if the keystore does not hold the private part of `key`.
	pub fn sign(
		keystore: &KeystorePtr,
		payload: Payload,
		context: &SigningContext,
		validator_index: ValidatorIndex,
		key: &ValidatorId,
	) -> Result<Option<Self>, KeystoreError> {
		let data = Self::payload_data(&payload, context);
		let signature = keystore.sr25519_sign(PARACHAIN_KEY_TYPE_ID, key, &data)?;

		Ok(signature.map(|signature| Self {
			payload,
			validator_index,
			signature,
			real_payload: PhantomData,
		}))
	}

	/// Validate the payload given the context and public key.
	pub fn check_signature(&self, context: &SigningContext, key: &ValidatorId) -> Result<(), ()> {
		let data = Self::payload_data(&self.payload, context);
		if verify(&self.signature, &data, key) {
			Ok(())
		} else {
			Err(())
		}
	}

	/// Immutably access the payload.
	#[inline]
	pub fn payload(&self) -> &Payload {
		&self.payload
	}

	/// Immutably access the validator index.
	#[inline]
	pub fn validator_index(&self) -> ValidatorIndex {
		self.validator_index
	}

	/// Immutably access the signature.
	#[inline]
	pub fn signature(&self) -> &ValidatorSignature {
		&self.signature
	}

	/// Discard signing data, get the payload.
	#[inline]
	pub fn into_payload(self) -> Payload {
		self.payload
	}

	/// Convert `Payload` into `RealPayload`.
	pub fn convert_payload(&self) -> Signed<RealPayload>
	where
		for<'a> &'a Payload: Into<RealPayload>,
	{
		Signed {
			signature: self.signature.clone(),
			validator_index: self.validator_index,
			payload: (&self.payload).into(),
			real_payload: PhantomData,
		}
	}

	/// Convert `Payload` into some `SuperPayload` if the encoding stays the same.
	///
	/// This invokes the closure on the current payload, which is irreversible.
	pub fn convert_to_superpayload_with<F, SuperPayload>(
		self,
		convert: F,
	) -> Result<Signed<SuperPayload, RealPayload>, SuperPayload>
	where
		F: FnOnce(Payload) -> SuperPayload,
		SuperPayload: EncodeAs<RealPayload>,
	{
		let expected_encode_as = self.payload.encode_as();
		let converted = convert(self.payload);
		if converted.encode_as() == expected_encode_as {
			Ok(Signed {
				payload: converted,
				validator_index: self.validator_index,
				signature: self.signature,
				real_payload: PhantomData,
			})
		} else {
			Err(converted)
		}
	}
}

pub(crate) fn verify(signature: &ValidatorSignature, data: &[u8], key: &ValidatorId) -> bool {
	sr25519::Pair::verify(signature, data, key)
}

/// This helper trait ensures that we can encode a full statement as its compact form,
/// and anything as itself.
///
/// Unlike `parity_scale_codec::EncodeLike`, which is a marker, this converts and encodes in
/// one step without cloning `Self`.
pub trait EncodeAs<T> {
	/// Convert Self into T, then encode T.
	fn encode_as(&self) -> Vec<u8>;
}

impl<T: Encode> EncodeAs<T> for T {
	fn encode_as(&self) -> Vec<u8> {
		self.encode()
	}
}
