use anyhow::{
    bail,
    ensure,
};
use enum_dispatch::enum_dispatch;
use log::{
    debug,
    warn,
};
use nalgebra::{
    DMatrix,
    DVector,
    SymmetricEigen,
};
use ndarray as na;
use rayon::prelude::*;

use crate::types::{
    HERMITIAN_TOL,
    Result,
    c64,
    Matrix,
    hermitian_defect,
};


/// Overlap eigenvalues below `-NEGATIVE_EIG_TOL` make the overlap non-physical.
pub const NEGATIVE_EIG_TOL: f64 = 1.0E-8;

/// Asymmetry of the overlap above this is reported when it gets symmetrized.
const ASYMMETRY_WARN_TOL: f64 = 1.0E-10;


/// Change of basis applied to the projected Hamiltonian before it is Fourier transformed.
#[enum_dispatch]
pub trait BasisCorrection {
    /// Express `hks`, shape `(nawf, nawf, nkpnts, nspin)`, in the basis whose overlap is `sks`,
    /// shape `(nawf, nawf, nkpnts)`.
    fn correct(&self, hks: na::Array4<c64>, sks: na::ArrayView3<c64>) -> Result<na::Array4<c64>>;

    fn is_orthogonal(&self) -> bool;
}


/// PAO basis treated as orthogonal, the Hamiltonian passes through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrthogonalBasis;


/// Non-orthogonal PAO basis: `H -> S^(1/2) H (S^(1/2))†` at every k-point and spin.
#[derive(Debug, Clone, Copy)]
pub struct NonOrthogonalBasis {
    pub tol: f64,
}


impl Default for NonOrthogonalBasis {
    fn default() -> Self {
        Self { tol: NEGATIVE_EIG_TOL }
    }
}


#[enum_dispatch(BasisCorrection)]
#[derive(Debug, Clone, Copy)]
pub enum Basis {
    OrthogonalBasis,
    NonOrthogonalBasis,
}


impl Basis {
    pub fn select(read_s: bool) -> Self {
        if read_s {
            NonOrthogonalBasis::default().into()
        } else {
            OrthogonalBasis.into()
        }
    }
}


impl BasisCorrection for OrthogonalBasis {
    fn correct(&self, hks: na::Array4<c64>, _sks: na::ArrayView3<c64>) -> Result<na::Array4<c64>> {
        Ok(hks)
    }

    fn is_orthogonal(&self) -> bool {
        true
    }
}


impl BasisCorrection for NonOrthogonalBasis {
    fn correct(&self, hks: na::Array4<c64>, sks: na::ArrayView3<c64>) -> Result<na::Array4<c64>> {
        let (nawf, nawf2, nkpnts, nspin) = hks.dim();
        ensure!(nawf == nawf2, "Hamiltonian blocks must be square, got {}x{}.", nawf, nawf2);
        ensure!(sks.dim() == (nawf, nawf, nkpnts),
            "Overlap has shape {:?}, but the Hamiltonian needs ({}, {}, {}).", sks.shape(), nawf, nawf, nkpnts);

        let s2k = (0 .. nkpnts).into_par_iter()
            .map(|ik| sqrt_hermitian(sks.slice(na::s![.., .., ik]), self.tol)
                 .map_err(|e| e.context(format!("Invalid overlap at k-point #{}", ik + 1))))
            .collect::<Result<Vec<Matrix<c64>>>>()?;

        let mut hks_no = hks;
        for (ik, s2) in s2k.iter().enumerate() {
            let s2_dag = s2.t().mapv(|v| v.conj());
            for ispin in 0 .. nspin {
                let h = s2.dot(&hks_no.slice(na::s![.., .., ik, ispin])).dot(&s2_dag);
                hks_no.slice_mut(na::s![.., .., ik, ispin]).assign(&h);
            }
        }

        debug!("Non-orthogonality correction applied on {} k-points.", nkpnts);
        Ok(hks_no)
    }

    fn is_orthogonal(&self) -> bool {
        false
    }
}


/// Principal square root `V diag(√w) V†` of a Hermitian positive semi-definite matrix.
///
/// `s` is replaced by `(S + S†) / 2` first, which fails when the relative asymmetry exceeds
/// [`HERMITIAN_TOL`]. Eigenvalues in `[-tol, 0)` are clamped to zero, anything below `-tol` is an
/// error.
pub fn sqrt_hermitian(s: na::ArrayView2<c64>, tol: f64) -> Result<Matrix<c64>> {
    let (n, m) = s.dim();
    ensure!(n == m, "Overlap must be square, got {}x{}.", n, m);

    let defect = hermitian_defect(s);
    ensure!(defect <= HERMITIAN_TOL, "Overlap is not Hermitian, relative |S - S†| = {:.3e}.", defect);
    if defect > ASYMMETRY_WARN_TOL {
        warn!("Overlap symmetrized, relative |S - S†| = {:.3e}.", defect);
    }

    let mat = DMatrix::<c64>::from_fn(n, n, |i, j| (s[(i, j)] + s[(j, i)].conj()) * 0.5);
    let eig = SymmetricEigen::new(mat);

    let wmin = eig.eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    if wmin < -tol {
        bail!("Overlap has a negative eigenvalue {:.6e}, the basis is not physical.", wmin);
    }
    if wmin < 0.0 {
        warn!("Overlap eigenvalue {:.3e} clamped to zero.", wmin);
    }

    let sqrt_w = DVector::<c64>::from_iterator(n,
        eig.eigenvalues.iter().map(|w| c64::new(w.max(0.0).sqrt(), 0.0)));
    let v = &eig.eigenvectors;
    let root = v * DMatrix::from_diagonal(&sqrt_w) * v.adjoint();

    Ok(Matrix::from_shape_fn((n, n), |(i, j)| root[(i, j)]))
}
