use std::fmt;

use anyhow::{
    bail,
    ensure,
    Context,
};
use log::debug;
use ndarray as na;
use nalgebra::{
    Matrix3,
    RowVector3,
};
use serde::{
    Serialize,
    Deserialize,
};

use crate::types::{
    Result,
    Mat33,
    Vector,
};


/// Tolerance of the k-point weight and R-weight sum rules.
pub const WEIGHT_TOL: f64 = 1.0E-8;

/// How far a k-point may sit from a grid node, in units of the node spacing.
const NODE_TOL: f64 = 1.0E-5;


/// Uniform Monkhorst-Pack style mesh `n1 x n2 x n3` in reciprocal space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid {
    pub n1: usize,
    pub n2: usize,
    pub n3: usize,
}


impl Grid {
    pub fn new(n1: usize, n2: usize, n3: usize) -> Result<Self> {
        ensure!(n1 > 0 && n2 > 0 && n3 > 0,
            "Invalid grid {}x{}x{}, every dimension must be positive.", n1, n2, n3);
        Ok(Self { n1, n2, n3 })
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.n1, self.n2, self.n3]
    }

    pub fn nktot(&self) -> usize {
        self.n1 * self.n2 * self.n3
    }

    /// Position of node `(i, j, k)` when the grid is visited with `k` running fastest.
    pub fn linear_index(&self, i: usize, j: usize, k: usize) -> usize {
        k + j * self.n3 + i * self.n2 * self.n3
    }

    /// The grid obtained by inserting `pad[d]` extra points along axis `d`.
    pub fn padded(&self, pad: [usize; 3]) -> Self {
        Self {
            n1: self.n1 + pad[0],
            n2: self.n2 + pad[1],
            n3: self.n3 + pad[2],
        }
    }
}


impl fmt::Display for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.n1, self.n2, self.n3)
    }
}


/// Split an FFT-ordered axis of `n` samples into `(low_count, high_count)`.
///
/// The first `low_count = ⌈n/2⌉` samples hold the non-negative frequencies and stay at the
/// front of a padded axis, the remaining `high_count = ⌊n/2⌋` samples hold the negative
/// frequencies and move to the back. For even `n` both blocks hold `n/2` samples. For odd `n`
/// the extra sample carries frequency `+⌊n/2⌋` and stays in the low block, so a single-sample
/// axis is never shifted and `low_count + high_count == n` always holds.
///
/// Every zero-padding routine and the lattice-vector mesh go through this function.
pub fn split_index(n: usize) -> (usize, usize) {
    let high = n / 2;
    (n - high, high)
}


/// Destination of sample `i` of an `n`-long FFT-ordered axis after `pad` zeros are inserted
/// between the low and the high block.
pub fn padded_index(i: usize, n: usize, pad: usize) -> usize {
    let (low, _) = split_index(n);
    if i < low { i } else { i + pad }
}


/// Whether sample `i` of an `n`-long FFT-ordered axis is the Nyquist sample, the one that stands
/// for both `+n/2` and `-n/2` on an even axis.
pub fn is_nyquist(i: usize, n: usize) -> bool {
    n % 2 == 0 && i == n / 2
}


/// Destinations of sample `i` of an `n`-long FFT-ordered axis after `pad` zeros are inserted,
/// with the fraction of the sample written there.
///
/// Once `pad > 0` separates `+n/2` from `-n/2`, the Nyquist sample of an even axis is shared
/// evenly between both slots. A padded real-space tensor then keeps `HR(-R) = HR(R)†`, and its
/// values at the original nodes are unchanged.
pub fn padded_slots(i: usize, n: usize, pad: usize) -> Vec<(usize, f64)> {
    if pad > 0 && is_nyquist(i, n) {
        vec![(i, 0.5), (i + pad, 0.5)]
    } else {
        vec![(padded_index(i, n, pad), 1.0)]
    }
}


/// Lattice coordinate of the `i`-th node of an `n`-long periodic axis, the high block of
/// [`split_index`] wrapped to negative values.
pub fn centered_index(i: usize, n: usize) -> i64 {
    let (low, _) = split_index(n);
    if i < low {
        i as i64
    } else {
        i as i64 - n as i64
    }
}


/// Index table `idx[i, j, k] -> k-point id` between the 3D grid and the order in which the DFT
/// code emitted its k-points.
#[derive(Debug, Clone)]
pub struct KIndex {
    grid: Grid,
    idx:  na::Array3<usize>,
}


impl KIndex {
    /// Table for k-points emitted in canonical order, i.e. `idx[i, j, k] = grid.linear_index(i, j, k)`.
    pub fn canonical(grid: Grid) -> Self {
        let idx = na::Array3::from_shape_fn((grid.n1, grid.n2, grid.n3),
            |(i, j, k)| grid.linear_index(i, j, k));
        Self { grid, idx }
    }

    /// Build the table from k-points in crystal (fractional) coordinates, shape `(nkpnts, 3)`.
    ///
    /// Every k-point must sit on a node of `grid` and every node must be hit exactly once.
    pub fn from_crystal(grid: Grid, kfrac: na::ArrayView2<f64>) -> Result<Self> {
        let nkpnts = kfrac.nrows();
        ensure!(kfrac.ncols() == 3, "K-points must have 3 components, got {}.", kfrac.ncols());
        ensure!(nkpnts == grid.nktot(),
            "Grid {} needs {} k-points, but {} k-points are provided.", grid, grid.nktot(), nkpnts);

        let dims = grid.dims();
        let mut idx = na::Array3::<usize>::from_elem((grid.n1, grid.n2, grid.n3), usize::MAX);

        for (ik, kpt) in kfrac.rows().into_iter().enumerate() {
            let mut node = [0usize; 3];
            for d in 0 .. 3 {
                let x = kpt[d] * dims[d] as f64;
                let r = x.round();
                if (x - r).abs() > NODE_TOL {
                    bail!("K-point #{} ({:.6}, {:.6}, {:.6}) is not on the {} grid.",
                        ik + 1, kpt[0], kpt[1], kpt[2], grid);
                }
                node[d] = (r as i64).rem_euclid(dims[d] as i64) as usize;
            }

            let slot = &mut idx[node];
            if *slot != usize::MAX {
                bail!("K-point #{} and #{} fall on the same grid node {:?}.", *slot + 1, ik + 1, node);
            }
            *slot = ik;
        }

        debug!("K-point index table built for grid {}", grid);
        Ok(Self { grid, idx })
    }

    /// Build the table from cartesian k-points, `b_vectors` holds one reciprocal vector per row
    /// in the same units.
    pub fn from_cartesian(grid: Grid, kcart: na::ArrayView2<f64>, b_vectors: &Mat33<f64>) -> Result<Self> {
        let kfrac = cartesian_to_crystal(kcart, b_vectors)?;
        Self::from_crystal(grid, kfrac.view())
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    pub fn get(&self, i: usize, j: usize, k: usize) -> usize {
        self.idx[[i, j, k]]
    }

    pub fn table(&self) -> &na::Array3<usize> {
        &self.idx
    }
}


/// Convert cartesian vectors (one per row) into coordinates along the rows of `basis`.
pub fn cartesian_to_crystal(cart: na::ArrayView2<f64>, basis: &Mat33<f64>) -> Result<na::Array2<f64>> {
    ensure!(cart.ncols() == 3, "Vectors must have 3 components, got {}.", cart.ncols());
    let b = Matrix3::new(
        basis[0][0], basis[0][1], basis[0][2],
        basis[1][0], basis[1][1], basis[1][2],
        basis[2][0], basis[2][1], basis[2][2],
    );
    let binv = b.try_inverse()
        .context("Basis vectors are linearly dependent, cannot convert to crystal coordinates.")?;

    let mut ret = na::Array2::<f64>::zeros(cart.raw_dim());
    for (v, mut out) in cart.rows().into_iter().zip(ret.rows_mut()) {
        let f = RowVector3::new(v[0], v[1], v[2]) * binv;
        out[0] = f[0];
        out[1] = f[1];
        out[2] = f[2];
    }
    Ok(ret)
}


/// Normalize k-point weights to unit sum and check that they describe the full, unreduced `grid`.
///
/// Each normalized weight must equal `1/N` and the weights scaled by `N` must sum to `N`,
/// both within [`WEIGHT_TOL`], `N = n1*n2*n3`.
pub fn normalize_weights(wght: na::ArrayView1<f64>, grid: Grid) -> Result<Vector<f64>> {
    let nktot = grid.nktot() as f64;
    ensure!(wght.len() == grid.nktot(),
        "Grid {} needs {} k-point weights, got {}.", grid, grid.nktot(), wght.len());

    let sumk = wght.sum();
    ensure!(sumk > 0.0, "Sum of k-point weights must be positive, got {}.", sumk);

    let normalized = wght.mapv(|w| w / sumk);
    if let Some((ik, w)) = normalized.iter().enumerate().find(|(_, w)| (*w * nktot - 1.0).abs() > WEIGHT_TOL) {
        bail!("Weight of k-point #{} is {:.10}, expected {:.10}: the k-points do not form the full {} grid.",
            ik + 1, w, 1.0 / nktot, grid);
    }

    let total = normalized.sum() * nktot;
    ensure!((total - nktot).abs() <= WEIGHT_TOL,
        "Wrong sum rule on k-point weights: {} != {}.", total, nktot);

    Ok(normalized)
}


/// Real-space lattice vectors commensurate with a k-grid, with their multiplicity weights.
#[derive(Debug, Clone)]
pub struct RGrid {
    grid:   Grid,
    r:      na::Array2<f64>,
    r_int:  Vec<[i64; 3]>,
    r_wght: Vector<f64>,
}


impl RGrid {
    /// Lattice vectors `R = m1*a1 + m2*a2 + m3*a3` with `m_d` the centered coordinate of each
    /// grid node, listed in [`Grid::linear_index`] order.
    pub fn new(grid: Grid, a_vectors: &Mat33<f64>) -> Result<Self> {
        let nrtot = grid.nktot();
        let mut r = na::Array2::<f64>::zeros((nrtot, 3));
        let mut r_int = vec![[0i64; 3]; nrtot];
        let r_wght = Vector::<f64>::ones(nrtot);

        for i in 0 .. grid.n1 {
            for j in 0 .. grid.n2 {
                for k in 0 .. grid.n3 {
                    let n = grid.linear_index(i, j, k);
                    let m = [
                        centered_index(i, grid.n1),
                        centered_index(j, grid.n2),
                        centered_index(k, grid.n3),
                    ];
                    for d in 0 .. 3 {
                        r[[n, d]] = m[0] as f64 * a_vectors[0][d]
                                  + m[1] as f64 * a_vectors[1][d]
                                  + m[2] as f64 * a_vectors[2][d];
                    }
                    r_int[n] = m;
                }
            }
        }

        let ret = Self { grid, r, r_int, r_wght };
        ret.check_weights()?;
        Ok(ret)
    }

    fn check_weights(&self) -> Result<()> {
        let sum = self.weight_sum();
        let nktot = self.grid.nktot() as f64;
        ensure!(self.r_int.len() == self.grid.nktot(),
            "Lattice-vector list has {} entries, grid {} needs {}.", self.r_int.len(), self.grid, self.grid.nktot());
        ensure!((sum - nktot).abs() <= WEIGHT_TOL,
            "Wrong sum rule on R weights: {} != {}.", sum, nktot);
        Ok(())
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    pub fn nrtot(&self) -> usize {
        self.r_int.len()
    }

    /// Cartesian lattice vectors, one per row, in the units of the lattice vectors.
    pub fn r(&self) -> &na::Array2<f64> {
        &self.r
    }

    /// Integer lattice coordinates of each vector.
    pub fn r_int(&self) -> &[[i64; 3]] {
        &self.r_int
    }

    pub fn r_wght(&self) -> &Vector<f64> {
        &self.r_wght
    }

    pub fn weight_sum(&self) -> f64 {
        self.r_wght.sum()
    }
}
