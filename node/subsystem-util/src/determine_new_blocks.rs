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


//! A utility for fetching all unknown blocks based on a new chain-head hash.

use futures::{channel::oneshot, prelude::*};
use para_node_subsystem::{messages::ChainApiMessage, SubsystemSender};
use para_primitives::{BlockNumber, Hash, Header};

/// How many ancestors are requested from the Chain API at once.
const ANCESTRY_STEP: usize = 4;

/// Given a new chain-head hash, this determines the hashes of all new blocks we should track
/// metadata for, given this head.
///
/// This is guaranteed to be a subset of the (inclusive) ancestry of `head` determined as all
/// blocks above the lower bound or above the highest known block, whichever is higher.
/// This is formatted in descending order by block height.
///
/// An implication of this is that if `head` itself is known or not above the lower bound,
/// then the returned list will be empty.
///
/// This may be somewhat expensive when first recovering from major sync.
pub async fn determine_new_blocks<E, Sender>(
	sender: &mut Sender,
	is_known: impl Fn(&Hash) -> Result<bool, E>,
	head: Hash,
	header: &Header,
	lower_bound_number: BlockNumber,
) -> Result<Vec<(Hash, Header)>, E>
where
	Sender: SubsystemSender,
{
	let min_block_needed = lower_bound_number + 1;

	if header.number < min_block_needed || is_known(&head)? {
		return Ok(Vec::new())
	}

	let mut ancestry = vec![(head, header.clone())];

	// The parent is either known or below the bound.
	if header.number == min_block_needed || is_known(&header.parent_hash)? {
		return Ok(ancestry)
	}

	loop {
		let (last_hash, last_header) = ancestry
			.last()
			.expect("ancestry has length 1 at initialization and is only added to; qed");

		debug_assert!(last_header.number > min_block_needed);

		// Non-zero, since the last block is always above the minimum here.
		let step = std::cmp::min(ANCESTRY_STEP, (last_header.number - min_block_needed) as usize);

		let batch_hashes = if step == 1 {
			vec![last_header.parent_hash]
		} else {
			let (tx, rx) = oneshot::channel();
			sender
				.send_message(ChainApiMessage::Ancestors {
					hash: *last_hash,
					k: step,
					response_channel: tx,
				})
				.await;

			match rx.await {
				Ok(Ok(ancestors)) => ancestors,
				// The chain DB failed us: return what we have.
				Err(_) | Ok(Err(_)) => return Ok(ancestry),
			}
		};

		let batch_headers = match fetch_headers(sender, &batch_hashes).await {
			Some(headers) => headers,
			None => return Ok(ancestry),
		};

		for (hash, header) in batch_hashes.into_iter().zip(batch_headers) {
			if header.number < min_block_needed || is_known(&hash)? {
				return Ok(ancestry)
			}

			let is_terminating = header.number == min_block_needed;
			ancestry.push((hash, header));

			if is_terminating {
				return Ok(ancestry)
			}
		}
	}
}

// Fetch all headers concurrently. `None` if any of them is missing.
async fn fetch_headers<Sender>(sender: &mut Sender, hashes: &[Hash]) -> Option<Vec<Header>>
where
	Sender: SubsystemSender,
{
	let mut receivers = Vec::with_capacity(hashes.len());
	for hash in hashes {
		let (tx, rx) = oneshot::channel();
		sender.send_message(ChainApiMessage::BlockHeader(*hash, tx)).await;
		receivers.push(rx);
	}

	let headers: Vec<Option<Header>> = future::join_all(receivers.into_iter().map(|rx| {
		rx.map(|res| match res {
			Ok(Ok(header)) => header,
			Err(_) | Ok(Err(_)) => None,
		})
	}))
	.await;

	headers.into_iter().collect()
}
