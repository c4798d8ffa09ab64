//! Coordinate frames, positions, axis limits, and the grid math.
//!
//! All lengths are micrometers. The prober reports chuck positions relative
//! to one of three reference frames (home, zero, center); the offsets
//! between frames drift with stage state, so a [`Position`] is only
//! meaningful together with its frame and conversions are done by the
//! driver against fresh instrument reads, never from cached offsets.
//!
//! The pure functions at the bottom ([`rotate_vector`], [`calibrate_theta`],
//! [`grid_to_stage`]) are the single path by which a logical device index
//! becomes physical stage coordinates; every measurement point goes through
//! them, so they are tested independently of any hardware.

use serde::{Deserialize, Serialize};

// =============================================================================
// Frames and positions
// =============================================================================

/// Reference frame for chuck coordinates.
///
/// The wire protocol identifies frames by a single letter; see [`Self::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinateFrame {
    /// Relative to the operator-set home position.
    Home,
    /// Relative to the stage zero.
    Zero,
    /// Relative to the chuck center. Axis limits are defined in this frame.
    Center,
}

impl CoordinateFrame {
    /// Single-letter frame code used by the prober protocol.
    pub fn code(&self) -> char {
        match self {
            CoordinateFrame::Home => 'H',
            CoordinateFrame::Zero => 'Z',
            CoordinateFrame::Center => 'C',
        }
    }
}

impl std::fmt::Display for CoordinateFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinateFrame::Home => write!(f, "home"),
            CoordinateFrame::Zero => write!(f, "zero"),
            CoordinateFrame::Center => write!(f, "center"),
        }
    }
}

/// A chuck position in micrometers, tagged with its reference frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    /// X coordinate in µm.
    pub x: f64,
    /// Y coordinate in µm.
    pub y: f64,
    /// Z coordinate in µm.
    pub z: f64,
    /// Frame the coordinates are expressed in.
    pub frame: CoordinateFrame,
}

impl Position {
    /// Create a position in the given frame.
    pub fn new(x: f64, y: f64, z: f64, frame: CoordinateFrame) -> Self {
        Self { x, y, z, frame }
    }

    /// The lateral components as a pair.
    pub fn xy(&self) -> (f64, f64) {
        (self.x, self.y)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({:.1}, {:.1}, {:.1}) µm [{}]",
            self.x, self.y, self.z, self.frame
        )
    }
}

// =============================================================================
// Axis limits
// =============================================================================

/// Inclusive per-axis travel bounds, expressed in the center frame.
///
/// Every commanded position must satisfy `min ≤ value ≤ max` on the axes
/// the move touches before the command is issued: XY moves check only x and
/// y, Z moves check only z.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisLimits {
    /// Minimum (x, y, z) in µm.
    #[serde(default = "default_limit_min")]
    pub min: [f64; 3],
    /// Maximum (x, y, z) in µm.
    #[serde(default = "default_limit_max")]
    pub max: [f64; 3],
}

fn default_limit_min() -> [f64; 3] {
    [-30_000.0, -30_000.0, 5_200.0]
}

fn default_limit_max() -> [f64; 3] {
    [30_000.0, 30_000.0, 13_000.0]
}

impl Default for AxisLimits {
    fn default() -> Self {
        Self {
            min: default_limit_min(),
            max: default_limit_max(),
        }
    }
}

impl AxisLimits {
    /// True when the lateral components are within bounds.
    pub fn contains_xy(&self, x: f64, y: f64) -> bool {
        self.min[0] <= x && x <= self.max[0] && self.min[1] <= y && y <= self.max[1]
    }

    /// True when the vertical component is within bounds.
    pub fn contains_z(&self, z: f64) -> bool {
        self.min[2] <= z && z <= self.max[2]
    }

    /// True when all three components are within bounds.
    pub fn contains(&self, x: f64, y: f64, z: f64) -> bool {
        self.contains_xy(x, y) && self.contains_z(z)
    }
}

// =============================================================================
// Grid indices
// =============================================================================

/// Logical device index on the substrate grid, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GridIndex {
    /// Column, 1-based.
    pub x: u32,
    /// Row, 1-based.
    pub y: u32,
}

impl GridIndex {
    /// Create a grid index.
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl std::fmt::Display for GridIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "X{}Y{}", self.x, self.y)
    }
}

// =============================================================================
// Pure grid math
// =============================================================================

/// Rotate `(x, y)` by `theta_deg` degrees counterclockwise.
pub fn rotate_vector(x: f64, y: f64, theta_deg: f64) -> (f64, f64) {
    let theta = theta_deg.to_radians();
    (
        theta.cos() * x - theta.sin() * y,
        theta.sin() * x + theta.cos() * y,
    )
}

/// Compute the pattern rotation from a measured substrate diagonal.
///
/// `dx`/`dy` are the home-frame coordinates read once the probe sits on the
/// corner opposite the home corner of the substrate (both negative in
/// normal operation, since stage coordinates run opposite to substrate
/// coordinates); `nominal_deg` is the diagonal's angle on an
/// untilted substrate (`atan(height / width)` of the drawn pattern). The
/// returned angle is the tilt to feed into [`grid_to_stage`].
///
/// The angle is taken from the ratio `dy / dx`, which makes the result
/// independent of which diagonal endpoint was home. A purely vertical
/// diagonal (`dx == 0`) resolves to ±90°; the result is NaN only when both
/// deltas are zero (no diagonal measured at all).
pub fn calibrate_theta(dx: f64, dy: f64, nominal_deg: f64) -> f64 {
    (dy / dx).atan().to_degrees() - nominal_deg
}

/// Nominal substrate coordinates of a grid index: `origin + index * pitch`
/// per axis.
///
/// This is the position on the drawn pattern itself, before any tilt or
/// stage negation; records are persisted against it so a die map can plot
/// measurements where they sit on the substrate.
pub fn grid_to_substrate(index: GridIndex, origin: (f64, f64), pitch: f64) -> (f64, f64) {
    (
        origin.0 + f64::from(index.x) * pitch,
        origin.1 + f64::from(index.y) * pitch,
    )
}

/// Map a grid index to home-frame stage coordinates.
///
/// The stage target is the [`grid_to_substrate`] vector negated (the chuck
/// moves under a fixed probe, so stage coordinates run opposite to
/// substrate coordinates) and rotated by the calibrated pattern angle.
pub fn grid_to_stage(
    index: GridIndex,
    origin: (f64, f64),
    pitch: f64,
    theta_pattern_deg: f64,
) -> (f64, f64) {
    let (x_subs, y_subs) = grid_to_substrate(index, origin, pitch);
    rotate_vector(-x_subs, -y_subs, theta_pattern_deg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-9;

    #[test]
    fn test_frame_codes() {
        assert_eq!(CoordinateFrame::Home.code(), 'H');
        assert_eq!(CoordinateFrame::Zero.code(), 'Z');
        assert_eq!(CoordinateFrame::Center.code(), 'C');
    }

    #[test]
    fn test_rotation_round_trips() {
        let cases = [
            (1.0, 0.0, 30.0),
            (-1300.0, -1300.0, 46.7),
            (157_600.0, 155_000.0, -121.5),
            (0.0, 0.0, 90.0),
        ];
        for (x, y, theta) in cases {
            let (xr, yr) = rotate_vector(x, y, theta);
            let (xb, yb) = rotate_vector(xr, yr, -theta);
            assert!((xb - x).abs() < TOL, "x: {xb} vs {x}");
            assert!((yb - y).abs() < TOL, "y: {yb} vs {y}");
        }
    }

    #[test]
    fn test_rotation_quarter_turn() {
        let (x, y) = rotate_vector(1.0, 0.0, 90.0);
        assert!(x.abs() < TOL);
        assert!((y - 1.0).abs() < TOL);
    }

    #[test]
    fn test_calibrate_theta_matches_measured_diagonal() {
        // 45° diagonal measured on a substrate drawn with a 46.7° diagonal:
        // the pattern sits at -1.7°, regardless of the measurement running
        // into the third quadrant.
        let theta = calibrate_theta(-24_700.0, -24_700.0, 46.7);
        assert!((theta - (45.0 - 46.7)).abs() < TOL);
    }

    #[test]
    fn test_calibrate_theta_vertical_diagonal_is_ninety() {
        assert!((calibrate_theta(0.0, 5.0, 0.0) - 90.0).abs() < TOL);
        assert!((calibrate_theta(0.0, -5.0, 0.0) + 90.0).abs() < TOL);
    }

    #[test]
    fn test_calibrate_theta_without_a_diagonal_is_nan() {
        assert!(calibrate_theta(0.0, 0.0, 46.7).is_nan());
    }

    #[test]
    fn test_grid_to_substrate_walks_the_pitch_from_the_origin() {
        let (x, y) = grid_to_substrate(GridIndex::new(2, 3), (905.0, 1200.0), 1300.0);
        assert!((x - 3505.0).abs() < TOL);
        assert!((y - 5100.0).abs() < TOL);
    }

    #[test]
    fn test_grid_to_stage_identity_rotation() {
        let target = grid_to_stage(GridIndex::new(1, 1), (0.0, 0.0), 1300.0, 0.0);
        assert!((target.0 - (-1300.0)).abs() < TOL);
        assert!((target.1 - (-1300.0)).abs() < TOL);

        let target = grid_to_stage(GridIndex::new(2, 3), (905.0, 1200.0), 1300.0, 0.0);
        assert!((target.0 - (-(905.0 + 2.0 * 1300.0))).abs() < TOL);
        assert!((target.1 - (-(1200.0 + 3.0 * 1300.0))).abs() < TOL);
    }

    #[test]
    fn test_grid_to_stage_ten_degrees_hand_computed() {
        // rotate_vector(-1300, -1300, 10°) with cos 10° = 0.98480775…,
        // sin 10° = 0.17364818…
        let (x, y) = grid_to_stage(GridIndex::new(1, 1), (0.0, 0.0), 1300.0, 10.0);
        assert!((x - (-1054.507_447_948_861)).abs() < 1e-6);
        assert!((y - (-1505.992_709_882_880)).abs() < 1e-6);
    }

    #[test]
    fn test_grid_to_stage_is_deterministic() {
        let a = grid_to_stage(GridIndex::new(7, 11), (905.0, 1200.0), 1300.0, -1.7);
        let b = grid_to_stage(GridIndex::new(7, 11), (905.0, 1200.0), 1300.0, -1.7);
        assert_eq!(a, b);
    }

    #[test]
    fn test_limits_are_inclusive_at_bounds() {
        let limits = AxisLimits::default();
        assert!(limits.contains_xy(30_000.0, -30_000.0));
        assert!(!limits.contains_xy(30_000.1, 0.0));
        assert!(limits.contains_z(13_000.0));
        assert!(limits.contains_z(5_200.0));
        assert!(!limits.contains_z(5_199.9));
        assert!(limits.contains(0.0, 0.0, 11_000.0));
    }

    #[test]
    fn test_grid_index_display() {
        assert_eq!(GridIndex::new(3, 17).to_string(), "X3Y17");
    }
}
