//! Consumers of the interpolated Hamiltonian: TB eigenvalues, density of states and the
//! comparison against the DFT eigenvalues.
use std::f64::consts::PI;

use anyhow::{
    ensure,
    Context,
};
use itertools::iproduct;
use nalgebra::{
    Cholesky,
    DMatrix,
    SymmetricEigen,
};
use ndarray as na;
use rayon::prelude::*;
use serde::{
    Serialize,
    Deserialize,
};

use crate::{
    comm::Comm,
    types::{
        HERMITIAN_TOL,
        Result,
        c64,
        Vector,
        hermitian_defect,
    },
};


/// Number of energy intervals of the DOS mesh.
pub const NDOS: usize = 1000;


/// Broadening kernel replacing the delta function of each eigenvalue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Smearing {
    #[default]
    Gauss,
}


impl Smearing {
    /// Weight of a state at distance `x = E - eig` for width `delta`, normalized to unit area.
    pub fn kernel(&self, x: f64, delta: f64) -> f64 {
        match self {
            Self::Gauss => {
                let y = x / delta;
                (-y * y).exp() / (PI.sqrt() * delta)
            },
        }
    }
}


/// Ascending eigenvalues of the Hermitian `h`, or of the generalized problem `h v = e s v`.
pub fn hermitian_eigenvalues(h: na::ArrayView2<c64>, s: Option<na::ArrayView2<c64>>) -> Result<Vec<f64>> {
    let (n, m) = h.dim();
    ensure!(n == m, "Hamiltonian must be square, got {}x{}.", n, m);
    let defect = hermitian_defect(h);
    ensure!(defect <= HERMITIAN_TOL, "Hamiltonian is not Hermitian, relative |H - H†| = {:.3e}.", defect);

    let mut a = DMatrix::<c64>::from_fn(n, n, |i, j| h[(i, j)]);
    if let Some(s) = s {
        ensure!(s.dim() == (n, n), "Overlap has shape {:?}, expected ({}, {}).", s.shape(), n, n);
        let smat = DMatrix::<c64>::from_fn(n, n, |i, j| s[(i, j)]);
        let chol = Cholesky::new(smat)
            .context("Overlap is not positive definite, cannot solve the generalized eigenproblem.")?;
        let linv = chol.l().try_inverse()
            .context("Cholesky factor of the overlap is singular.")?;
        a = &linv * a * linv.adjoint();
    }

    let mut w = SymmetricEigen::new(a).eigenvalues.iter().copied().collect::<Vec<f64>>();
    w.sort_by(|x, y| x.total_cmp(y));
    Ok(w)
}


/// Eigenvalues of `hk`, shape `(nawf, nawf, nk, nspin)`, returned as `(nawf, nk, nspin)`.
///
/// With `sk` of shape `(nawf, nawf, nk)` the generalized problem is solved at each k-point.
pub fn tb_eigenvalues(hk: na::ArrayView4<c64>, sk: Option<na::ArrayView3<c64>>) -> Result<na::Array3<f64>> {
    let (nawf, _, nk, nspin) = hk.dim();
    if let Some(sk) = sk.as_ref() {
        ensure!(sk.dim() == (nawf, nawf, nk),
            "Overlap has shape {:?}, but the Hamiltonian needs ({}, {}, {}).", sk.shape(), nawf, nawf, nk);
    }

    let eigs = iproduct!(0 .. nk, 0 .. nspin)
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|(ik, ispin)| {
            let s = sk.as_ref().map(|s| s.slice(na::s![.., .., ik]));
            hermitian_eigenvalues(hk.slice(na::s![.., .., ik, ispin]), s)
                .with_context(|| format!("Diagonalization failed at k-point #{}, spin {}", ik + 1, ispin + 1))
                .map(|w| ((ik, ispin), w))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut ret = na::Array3::<f64>::zeros((nawf, nk, nspin));
    for ((ik, ispin), w) in eigs {
        ret.slice_mut(na::s![.., ik, ispin]).assign(&Vector::from(w));
    }
    Ok(ret)
}


/// Smeared density of states of all `eigs` on [`NDOS`] energies from `min(E)` up to
/// `max(E) - shift/2`, the upper end excluded.
///
/// The energy mesh is partitioned over the workers and summed on the root, which alone receives
/// `Some((energies, dos))`.
pub fn smeared_dos<C: Comm>(comm: &C, eigs: na::ArrayView3<f64>, smearing: Smearing, delta: f64, shift: f64) -> Result<Option<(Vector<f64>, Vector<f64>)>> {
    ensure!(delta > 0.0, "Smearing width must be positive, got {}.", delta);
    ensure!(!eigs.is_empty(), "No eigenvalues to compute the DOS from.");

    let emin = eigs.iter().copied().fold(f64::INFINITY, f64::min);
    let emax = eigs.iter().copied().fold(f64::NEG_INFINITY, f64::max) - shift / 2.0;
    ensure!(emax > emin, "Empty DOS energy window: emin = {:.5}, emax = {:.5}.", emin, emax);

    let de = (emax - emin) / NDOS as f64;
    let ene = Vector::<f64>::from_shape_fn(NDOS, |i| emin + i as f64 * de);

    let (start, end) = comm.partition(NDOS)?;
    let part = (start .. end).into_par_iter()
        .map(|ie| eigs.iter().map(|e| smearing.kernel(ene[ie] - e, delta)).sum::<f64>())
        .collect::<Vec<f64>>();

    let mut dos = Vector::<f64>::zeros(NDOS);
    dos.slice_mut(na::s![start .. end]).assign(&Vector::from(part));

    Ok(comm.reduce_sum(dos)?.map(|dos| (ene, dos)))
}


/// Side by side TB and DFT eigenvalues of the lowest `nbnd` bands.
#[derive(Debug, Clone)]
pub struct EigComparison {
    pub kpoint: Vector<f64>,
    pub spin:   Vector<f64>,
    pub band:   Vector<f64>,
    pub dft:    Vector<f64>,
    pub tb:     Vector<f64>,
    pub diff:   Vector<f64>,
}


impl EigComparison {
    pub fn new(tb: na::ArrayView3<f64>, dft: na::ArrayView3<f64>, nbnd: usize) -> Result<Self> {
        let (ntb, nk, nspin) = tb.dim();
        let ndft = dft.dim().0;
        ensure!(dft.dim().1 == nk && dft.dim().2 == nspin,
            "DFT eigenvalues have shape {:?}, TB eigenvalues {:?}.", dft.shape(), tb.shape());
        ensure!(nbnd > 0 && nbnd <= ntb.min(ndft),
            "Cannot compare {} bands: {} TB and {} DFT bands available.", nbnd, ntb, ndft);

        let rows = iproduct!(0 .. nspin, 0 .. nk, 0 .. nbnd).collect::<Vec<_>>();
        let col = |f: &dyn Fn(usize, usize, usize) -> f64| rows.iter()
            .map(|&(ispin, ik, n)| f(ispin, ik, n))
            .collect::<Vector<f64>>();

        Ok(Self {
            kpoint: col(&|_, ik, _| (ik + 1) as f64),
            spin:   col(&|ispin, _, _| (ispin + 1) as f64),
            band:   col(&|_, _, n| (n + 1) as f64),
            dft:    col(&|ispin, ik, n| dft[[n, ik, ispin]]),
            tb:     col(&|ispin, ik, n| tb[[n, ik, ispin]]),
            diff:   col(&|ispin, ik, n| tb[[n, ik, ispin]] - dft[[n, ik, ispin]]),
        })
    }

    pub fn max_abs_diff(&self) -> f64 {
        self.diff.iter().fold(0.0, |acc, d| acc.max(d.abs()))
    }

    pub fn columns(&self) -> Vec<&Vector<f64>> {
        vec![&self.kpoint, &self.spin, &self.band, &self.dft, &self.tb, &self.diff]
    }
}
