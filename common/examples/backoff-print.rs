// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Show example retry intervals and times for the ISO upload policy

use vch_common::backoff;
use vch_common::backoff::Backoff;

fn main() {
    let mut policy = backoff::retry_policy_upload();
    let mut total_duration = std::time::Duration::from_secs(0);
    for attempt in 1..=backoff::UPLOAD_MAX_ATTEMPTS {
        let nmin = total_duration.as_secs() / 60;
        let nsecs = total_duration.as_secs() % 60;
        print!("attempt {attempt} at T={:3}m{:02}s: ", nmin, nsecs);

        match policy.next_backoff() {
            Some(next) => {
                let (nmin, nsecs) = (next.as_secs() / 60, next.as_secs() % 60);
                println!("wait {:3}m{:02}s", nmin, nsecs);
                total_duration += next;
            }
            None => {
                println!("give up");
                break;
            }
        }
    }
}
