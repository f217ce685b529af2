// Copyright 2026 Primev, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tiered accrual schedule converting active blocks into loyalty points.
//!
//! Durations are converted to whole elapsed months (floor division by [BLOCKS_PER_MONTH]),
//! and each month count maps onto a fixed schedule. Identities still registered at the
//! reference block earn [Accrual::total_points]; identities that already left earn the
//! smaller [Accrual::early_exit_points], which forfeits the bonuses paid out at the
//! 6, 12 and 18 month milestones.

/// Roughly one month of Ethereum blocks.
pub const BLOCKS_PER_MONTH: u64 = 216_000;

/// Month at which the schedule stops growing.
pub const TERMINAL_MONTH: u64 = 18;

/// Highest number of points a single interval can earn.
pub const MAX_POINTS: u64 = 700_000;

/// Points for identities still registered, indexed by whole elapsed months.
const TOTAL_POINTS_BY_MONTH: [u64; TERMINAL_MONTH as usize + 1] = [
    0,       // 0
    10_000,  // 1
    22_700,  // 2
    38_000,  // 3
    56_000,  // 4
    76_700,  // 5
    100_000, // 6
    120_000, // 7
    145_000, // 8
    175_000, // 9
    210_000, // 10
    250_000, // 11
    300_000, // 12
    340_000, // 13
    390_800, // 14
    450_000, // 15
    520_000, // 16
    600_000, // 17
    MAX_POINTS,
];

const EARLY_EXIT_POINTS_PER_MONTH: u64 = 10_000;
const SIX_MONTH_EARLY_EXIT_BASE: u64 = 100_000;
const TWELVE_MONTH_EARLY_EXIT_BASE: u64 = 300_000;

/// Result of running the accrual schedule over one interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accrual {
    /// Points credited when the interval is still open at the reference block.
    pub total_points: u64,
    /// Points credited when the interval closed before the reference block.
    pub early_exit_points: u64,
}

impl Accrual {
    /// Select the figure that applies to an interval with the given status.
    pub fn for_status(&self, closed: bool) -> u64 {
        if closed {
            self.early_exit_points
        } else {
            self.total_points
        }
    }
}

/// Whole months elapsed over `active_blocks`; negative durations count as zero.
pub fn elapsed_months(active_blocks: i64) -> u64 {
    if active_blocks <= 0 {
        return 0;
    }
    active_blocks as u64 / BLOCKS_PER_MONTH
}

/// Run the schedule for an interval that has been active for `active_blocks`.
pub fn accrue(active_blocks: i64) -> Accrual {
    let months = elapsed_months(active_blocks);
    Accrual { total_points: total_points(months), early_exit_points: early_exit_points(months) }
}

fn total_points(months: u64) -> u64 {
    let idx = months.min(TERMINAL_MONTH) as usize;
    TOTAL_POINTS_BY_MONTH[idx]
}

fn early_exit_points(months: u64) -> u64 {
    match months {
        0..=6 => months * EARLY_EXIT_POINTS_PER_MONTH,
        7..=11 => SIX_MONTH_EARLY_EXIT_BASE + (months - 6) * EARLY_EXIT_POINTS_PER_MONTH,
        12 => TWELVE_MONTH_EARLY_EXIT_BASE,
        13..=17 => TWELVE_MONTH_EARLY_EXIT_BASE + (months - 12) * EARLY_EXIT_POINTS_PER_MONTH,
        _ => MAX_POINTS,
    }
}

/// Signed block distance between two heights, saturating at the `i64` bounds.
pub fn blocks_between(start: u64, end: u64) -> i64 {
    if end >= start {
        i64::try_from(end - start).unwrap_or(i64::MAX)
    } else {
        i64::try_from(start - end).map(|d| -d).unwrap_or(i64::MIN)
    }
}

/// Points an interval `[opted_in_block, opted_out_block)` has earned as of `reference_block`.
///
/// An interval counts as closed only if it closed at or before the reference block; a later
/// close is invisible to a historical query, so the interval is scored as open up to the
/// reference block.
pub fn interval_points(
    opted_in_block: u64,
    opted_out_block: Option<u64>,
    reference_block: u64,
) -> u64 {
    let closed_at = opted_out_block.filter(|&out| out <= reference_block);
    let effective_end = closed_at.unwrap_or(reference_block);
    accrue(blocks_between(opted_in_block, effective_end)).for_status(closed_at.is_some())
}
