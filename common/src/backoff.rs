// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations with exponential backoff.

use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// Maximum number of attempts made to upload a single image to a datastore.
pub const UPLOAD_MAX_ATTEMPTS: usize = 5;

/// Return a backoff policy for uploading ISO images to a datastore.
///
/// Uploads are slow and a busy datastore can stall them for minutes, so the
/// policy starts at ten seconds, caps each wait at a minute and gives up
/// after half an hour. Callers additionally bound the number of attempts
/// with [`UPLOAD_MAX_ATTEMPTS`].
pub fn retry_policy_upload() -> ::backoff::ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_secs(10);
    const MAX_INTERVAL: Duration = Duration::from_secs(60);
    const MAX_ELAPSED: Duration = Duration::from_secs(30 * 60);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL, Some(MAX_ELAPSED))
}

/// Return a backoff policy for removing a snapshot that vSAN reports as
/// failed with a `SystemError` while it settles.
pub fn retry_policy_system_error() -> ::backoff::ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(500);
    const MAX_INTERVAL: Duration = Duration::from_secs(15);
    const MAX_ELAPSED: Duration = Duration::from_secs(2 * 60);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL, Some(MAX_ELAPSED))
}

/// Return a backoff policy for polling conditions that are expected to
/// become true within a few seconds, such as a guest publishing a key.
pub fn retry_policy_poll() -> ::backoff::ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(250);
    const MAX_INTERVAL: Duration = Duration::from_secs(2);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL, None)
}

fn policy_with_max(
    initial_interval: Duration,
    max_interval: Duration,
    max_elapsed_time: Option<Duration>,
) -> ::backoff::ExponentialBackoff {
    let current_interval = initial_interval;
    ::backoff::ExponentialBackoff {
        current_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time,
        ..backoff::ExponentialBackoff::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn upload_policy_is_bounded() {
        let mut policy = retry_policy_upload();
        policy.randomization_factor = 0.0;
        let waits: Vec<Duration> = (0..UPLOAD_MAX_ATTEMPTS)
            .filter_map(|_| policy.next_backoff())
            .collect();
        assert_eq!(waits.len(), UPLOAD_MAX_ATTEMPTS);
        assert_eq!(waits[0], Duration::from_secs(10));
        assert!(waits.iter().all(|w| *w <= Duration::from_secs(60)));
    }
}
