//! Interpolation weights over the tabulated (T, nₑ) grid.
//!
//! The grid is a sparse list of tabulated points that need not form a
//! rectangular mesh. A target is resolved to at most four corner points with
//! weights summing to one: two points for a pure temperature or density
//! sweep, four for the general bilinear case.

use crate::error::{Error, Result};
use arrayvec::ArrayVec;
use log::warn;

/// Corner points of an interpolation: (grid-point index, weight).
pub type Corners = ArrayVec<(usize, f64), 4>;

/// Linear interpolation along one tabulated axis.
///
/// Returns the bracketing indices `i, i+1` with weights `1 - p, p`. Targets
/// outside the tabulated range clamp onto the nearest endpoint, which
/// receives two symmetric half weights.
pub fn linear_weights(x: f32, table: &[f32]) -> Result<Corners> {
    let n = table.len();
    if n == 0 {
        return Err(Error::InvalidParam("empty interpolation table".into()));
    }

    let mut corners = Corners::new();
    if n == 1 {
        corners.push((0, 1.0));
        return Ok(corners);
    }

    if x < table[0] || x >= table[n - 1] {
        let clamp = if x < table[0] { 0 } else { n - 1 };
        if x < table[0] || x > table[n - 1] {
            warn!(
                "{x:11.4e} is outside [{:11.4e}, {:11.4e}]",
                table[0],
                table[n - 1]
            );
        }
        corners.push((clamp, 0.5));
        corners.push((clamp, 0.5));
        return Ok(corners);
    }

    let i = table.partition_point(|&t| t <= x) - 1;
    let p = f64::from((x - table[i]) / (table[i + 1] - table[i]));
    corners.push((i, 1.0 - p));
    corners.push((i + 1, p));
    Ok(corners)
}

/// Bilinear interpolation with nearest-neighbor corner discovery.
///
/// Tabulated points are classified into quadrants around the target by the
/// signs of `ln(T/T_k)` and `ln(nₑ/nₑ_k)`; the nearest point of each
/// quadrant (in log distance) becomes a corner. Weights are the bilinear
/// fractions of the target between opposing corners, measured in log space
/// so that the geometric center of four corners receives four quarter
/// weights.
///
/// # Errors
///
/// [`Error::Corruption`] when a quadrant is empty or the four corners are
/// not distinct; [`Error::OutOfRange`] when a fraction leaves `[0, 1]`.
pub fn bilinear_weights(
    temp: f32,
    density: f32,
    temps: &[f32],
    densities: &[f32],
) -> Result<Corners> {
    if temp <= 0.0 || density <= 0.0 || temps.is_empty() || temps.len() != densities.len() {
        return Err(Error::InvalidParam(format!(
            "interpolation target ({temp:.4e}, {density:.4e})"
        )));
    }

    // ip[1] = T-high, n-low    ip[3] = T-low, n-low
    // ip[0] = T-high, n-high   ip[2] = T-low, n-high
    let mut corner = [None::<usize>; 4];
    let mut dist = [f64::MAX; 4];

    for i in 0..temps.len() {
        let dx = f64::from(temp / temps[i]).ln();
        let dy = f64::from(density / densities[i]).ln();

        let mut quadrant = 0;
        if dy >= 0.0 {
            quadrant += 1;
        }
        if dx >= 0.0 {
            quadrant += 2;
        }

        let r2 = dx.mul_add(dx, dy * dy);
        if r2 < dist[quadrant] {
            dist[quadrant] = r2;
            corner[quadrant] = Some(i);
        }
    }

    let [Some(c0), Some(c1), Some(c2), Some(c3)] = corner else {
        return Err(Error::Corruption(format!(
            "no bracketing grid points around ({temp:.4e}, {density:.4e})"
        )));
    };
    let chosen = [c0, c1, c2, c3];
    for a in 0..4 {
        for b in a + 1..4 {
            if chosen[a] == chosen[b] {
                return Err(Error::Corruption(format!(
                    "degenerate interpolation corners around ({temp:.4e}, {density:.4e})"
                )));
            }
        }
    }

    // log-space fraction toward the high-T corner pair
    let fx = if (temps[c2] - temps[c0]).abs() > 0.0 {
        f64::from(temps[c2] / temp).ln() / f64::from(temps[c2] / temps[c0]).ln()
    } else {
        0.5
    };
    let fy = if (densities[c1] - densities[c0]).abs() > 0.0 {
        f64::from(densities[c1] / density).ln() / f64::from(densities[c1] / densities[c0]).ln()
    } else {
        0.5
    };

    if !(0.0..=1.0).contains(&fx) || !(0.0..=1.0).contains(&fy) {
        return Err(Error::OutOfRange(format!(
            "({temp:.4e}, {density:.4e}) is outside the tabulated grid"
        )));
    }

    let mut corners = Corners::new();
    corners.push((c0, fx * fy));
    corners.push((c1, fx * (1.0 - fy)));
    corners.push((c2, (1.0 - fx) * fy));
    corners.push((c3, (1.0 - fx) * (1.0 - fy)));
    Ok(corners)
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn linear_interior() {
        let table = [1.0e6, 1.0e7, 1.0e8];
        let corners = linear_weights(5.5e6, &table).unwrap();
        assert_eq!(corners.len(), 2);
        assert_eq!(corners[0].0, 0);
        assert_eq!(corners[1].0, 1);
        assert_approx_eq!(f64, corners[0].1, 0.5, epsilon = 1e-12);
        assert_approx_eq!(f64, corners[1].1, 0.5, epsilon = 1e-12);
        assert_approx_eq!(f64, corners[0].1 + corners[1].1, 1.0);
    }

    #[test]
    fn linear_on_node() {
        let table = [1.0e6, 1.0e7, 1.0e8];
        let corners = linear_weights(1.0e7, &table).unwrap();
        assert_eq!(corners[0], (1, 1.0));
        assert_approx_eq!(f64, corners[1].1, 0.0);
    }

    #[test]
    fn linear_clamps_endpoints() {
        let table = [1.0e6, 1.0e7];
        for x in [1.0e5_f32, 1.0e7, 5.0e8] {
            let corners = linear_weights(x, &table).unwrap();
            assert_eq!(corners[0].0, corners[1].0);
            assert_approx_eq!(f64, corners[0].1, 0.5);
            assert_approx_eq!(f64, corners[1].1, 0.5);
        }
    }

    fn four_point_grid() -> (Vec<f32>, Vec<f32>) {
        (
            vec![1.0e6, 1.0e6, 1.0e8, 1.0e8],
            vec![1.0e9, 1.0e11, 1.0e9, 1.0e11],
        )
    }

    #[test]
    fn bilinear_at_node_is_exact() {
        let (temps, densities) = four_point_grid();
        let corners = bilinear_weights(1.0e6, 1.0e9, &temps, &densities).unwrap();
        let mut weight = [0.0_f64; 4];
        for (i, w) in corners {
            weight[i] += w;
        }
        assert_approx_eq!(f64, weight[0], 1.0, epsilon = 1e-12);
        assert_approx_eq!(f64, weight[1], 0.0, epsilon = 1e-12);
        assert_approx_eq!(f64, weight[2], 0.0, epsilon = 1e-12);
        assert_approx_eq!(f64, weight[3], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn bilinear_at_geometric_center() {
        let (temps, densities) = four_point_grid();
        let corners = bilinear_weights(1.0e7, 1.0e10, &temps, &densities).unwrap();
        for &(_, w) in &corners {
            assert_approx_eq!(f64, w, 0.25, epsilon = 1e-12);
        }
        let total: f64 = corners.iter().map(|&(_, w)| w).sum();
        assert_approx_eq!(f64, total, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn bilinear_outside_grid_fails() {
        let (temps, densities) = four_point_grid();
        assert!(matches!(
            bilinear_weights(1.0e5, 1.0e10, &temps, &densities),
            Err(Error::Corruption(_))
        ));
        assert!(bilinear_weights(-1.0, 1.0e10, &temps, &densities).is_err());
    }

    #[test]
    fn bilinear_rejects_degenerate_corners() {
        // three collinear points cannot bracket anything
        let temps = vec![1.0e6, 1.0e7, 1.0e8];
        let densities = vec![1.0e9, 1.0e10, 1.0e11];
        assert!(bilinear_weights(2.0e6, 5.0e10, &temps, &densities).is_err());
    }
}
