// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use core_protocol::get_unix_time_now;
use core_protocol::id::SessionToken;
use rand::Rng;
use std::num::NonZeroU64;

const DAY_BITS: u32 = 10;

/// Gets a value that increments by 1 every 24 hours.
fn get_unix_day() -> u64 {
    get_unix_time_now() / (24 * 60 * 60 * 1000)
}

/// Generates a random 64 bit id whose top bits derive from the current day,
/// so uniqueness checks only need to consider ids minted recently.
pub fn generate_id_64() -> NonZeroU64 {
    generate_id_64_with_day(get_unix_day())
}

/// Generates an unguessable bearer token. Unlike ids, tokens carry no date
/// prefix; all bits are random.
pub fn generate_session_token() -> SessionToken {
    rand::thread_rng().gen()
}

pub(crate) fn generate_id_64_with_day(day: u64) -> NonZeroU64 {
    let most_sig_bits = day.wrapping_shl(64 - DAY_BITS);

    let mut r: u64 = rand::thread_rng().gen();
    if r == 0 {
        // Preserve non-zero guarantee.
        r = 1;
    }
    let least_sig_bits = r & ((1 << (64 - DAY_BITS)) - 1);

    debug_assert!(most_sig_bits & least_sig_bits == 0);

    NonZeroU64::new(most_sig_bits | least_sig_bits).unwrap()
}

#[cfg(test)]
mod test {
    use crate::generate_id::{generate_id_64_with_day, generate_session_token};

    #[test]
    fn ids_nonzero_for_any_day() {
        for day in 0..2u64.pow(12) {
            let _ = generate_id_64_with_day(day);
        }
    }

    #[test]
    fn tokens_do_not_repeat_trivially() {
        let a = generate_session_token();
        let b = generate_session_token();
        // Astronomically unlikely to collide.
        assert_ne!(a, b);
    }
}
