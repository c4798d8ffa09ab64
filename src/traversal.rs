//! Pure generators for grid visit orders.
//!
//! A traversal is just an ordered `Vec<GridIndex>` computed up front; the
//! orchestrator walks it without ever consulting these functions again.
//! Serpentine ([`zigzag`]) is the production order — it minimizes stage
//! travel between neighbouring devices. [`row_major`] and [`spiral`] exist
//! for test structures and quick partial maps.

use serde::{Deserialize, Serialize};

use crate::coord::GridIndex;
use crate::error::{ProbeError, Result};

/// Horizontal direction of the first serpentine row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Walk the first row towards increasing X.
    Right,
    /// Walk the first row towards decreasing X.
    Left,
}

/// Which generator to use for a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalKind {
    /// Serpentine rows, alternating direction.
    Zigzag,
    /// Plain row-by-row order.
    RowMajor,
    /// Inward clockwise spiral from (1, 1).
    Spiral,
}

/// Build the visit order for `kind`.
///
/// `start` only affects [`zigzag`] (resuming a scan mid-row); the other
/// generators always cover the full grid from (1, 1).
pub fn plan(
    kind: TraversalKind,
    start: GridIndex,
    max: GridIndex,
    direction: Direction,
) -> Result<Vec<GridIndex>> {
    match kind {
        TraversalKind::Zigzag => zigzag(start, max, direction),
        TraversalKind::RowMajor => Ok(row_major(max)),
        TraversalKind::Spiral => Ok(spiral(max)),
    }
}

/// Serpentine order: from `start` to the edge of its row in `direction`,
/// then full rows `1..=max.x` upward, alternating direction each row.
///
/// The first row is partial when `start.x` is not at the edge, and rows
/// below `start.y` are not visited — this is what lets an interrupted scan
/// resume where it stopped.
pub fn zigzag(start: GridIndex, max: GridIndex, direction: Direction) -> Result<Vec<GridIndex>> {
    if start.x > max.x || start.y > max.y {
        return Err(ProbeError::Configuration(format!(
            "traversal start {start} outside grid X{}Y{}",
            max.x, max.y
        )));
    }

    let mut order = Vec::with_capacity((max.x * max.y) as usize);
    let mut y = start.y;

    let mut go_right = match direction {
        Direction::Right => {
            let mut x = start.x;
            while x <= max.x {
                order.push(GridIndex::new(x, y));
                x += 1;
            }
            false
        }
        Direction::Left => {
            let mut x = start.x;
            while x >= 1 {
                order.push(GridIndex::new(x, y));
                x -= 1;
            }
            true
        }
    };
    y += 1;

    while y <= max.y {
        if go_right {
            order.extend((1..=max.x).map(|x| GridIndex::new(x, y)));
        } else {
            order.extend((1..=max.x).rev().map(|x| GridIndex::new(x, y)));
        }
        go_right = !go_right;
        y += 1;
    }
    Ok(order)
}

/// Row-by-row order over the full grid, rows bottom-up, columns ascending.
pub fn row_major(max: GridIndex) -> Vec<GridIndex> {
    let mut order = Vec::with_capacity((max.x * max.y) as usize);
    for y in 1..=max.y {
        for x in 1..=max.x {
            order.push(GridIndex::new(x, y));
        }
    }
    order
}

/// Inward clockwise spiral: along the bottom row from (1, 1), up the right
/// edge, back along the top, down the left edge, then the next ring in.
pub fn spiral(max: GridIndex) -> Vec<GridIndex> {
    let mut order = Vec::with_capacity((max.x * max.y) as usize);
    let (mut x_lo, mut x_hi) = (1u32, max.x);
    let (mut y_lo, mut y_hi) = (1u32, max.y);

    while x_lo <= x_hi && y_lo <= y_hi {
        for x in x_lo..=x_hi {
            order.push(GridIndex::new(x, y_lo));
        }
        for y in (y_lo + 1)..=y_hi {
            order.push(GridIndex::new(x_hi, y));
        }
        if y_lo < y_hi {
            for x in (x_lo..x_hi).rev() {
                order.push(GridIndex::new(x, y_hi));
            }
        }
        if x_lo < x_hi {
            for y in ((y_lo + 1)..y_hi).rev() {
                order.push(GridIndex::new(x_lo, y));
            }
        }
        x_lo += 1;
        y_lo += 1;
        if x_hi < x_lo || y_hi < y_lo {
            break;
        }
        x_hi -= 1;
        y_hi -= 1;
    }
    order
}
