// Copyright (C) 2019-2021  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::HwAccessRef;

use core::time::Duration;

/// Keeps track of the attempts of an operation that is retried a bounded number of times, with
/// a fixed delay between two attempts.
///
/// ```ignore
/// let mut retry = BoundedRetry::new(100, Duration::from_micros(100));
/// while retry.next_attempt(&access).await {
///     if check().await {
///         return Ok(());
///     }
/// }
/// Err(Timeout)
/// ```
#[derive(Debug, Clone)]
pub(crate) struct BoundedRetry {
    /// Number of attempts that haven't been started yet.
    remaining: u32,
    /// Time to wait between two attempts.
    interval: Duration,
    /// True if at least one attempt has been started. No delay happens before the first one.
    started: bool,
}

impl BoundedRetry {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        BoundedRetry {
            remaining: attempts,
            interval,
            started: false,
        }
    }

    /// Waits until the next attempt can be started.
    ///
    /// Returns `false` if all the attempts have been used up, in which case the operation must
    /// be considered as timed out.
    pub async fn next_attempt<TAcc>(&mut self, access: &TAcc) -> bool
    where
        for<'r> &'r TAcc: HwAccessRef<'r>,
    {
        if self.remaining == 0 {
            return false;
        }

        if self.started {
            access.delay(self.interval).await;
        }

        self.started = true;
        self.remaining -= 1;
        true
    }
}
