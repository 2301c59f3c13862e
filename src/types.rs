use ndarray::{
    Array1,
    Array2,
    Array3,
    ArrayView2,
};
use num::complex::Complex;

pub type Result<T> = anyhow::Result<T>;

#[allow(non_camel_case_types)]
pub type c64 = Complex<f64>;

pub type Vector<T> = Array1<T>;  // Define this type to use broadcast operations.
pub type Matrix<T> = Array2<T>;
pub type Cube<T>   = Array3<T>;
pub type Mat33<T>  = [[T;3];3];   // 3x3 matrix, one lattice vector per row


/// Largest element-wise modulus of `a - b`, used to compare complex tensors.
pub fn max_abs_diff<'a, I>(a: I, b: I) -> f64
where I: IntoIterator<Item = &'a c64> {
    a.into_iter()
        .zip(b)
        .map(|(x, y)| (x - y).norm())
        .fold(0.0, f64::max)
}


/// Relative tolerance on `|M - M†|` for matrices that must be Hermitian.
pub const HERMITIAN_TOL: f64 = 1.0E-6;


/// Largest `|M - M†|` of a square matrix, relative to `max(1, max |M|)`.
pub fn hermitian_defect(m: ArrayView2<c64>) -> f64 {
    let scale = m.iter().map(|v| v.norm()).fold(1.0, f64::max);
    let m_dag = m.t().mapv(|v| v.conj());
    max_abs_diff(m.iter(), m_dag.iter()) / scale
}
