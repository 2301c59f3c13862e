use std::{
    fs::File,
    io::{
        BufWriter,
        Write,
    },
    path::Path,
};

use anyhow::{
    ensure,
    Context,
};
use itertools::Itertools;
use ndarray::Axis;

use crate::types::{
    Result,
    Vector,
    Cube,
};


/// Write equally long `cols` side by side, one row per element, below a `# header` line.
pub fn write_columns(file_name: &(impl AsRef<Path> + ?Sized), cols: &[&Vector<f64>], header: &str) -> Result<()> {
    let file_name = file_name.as_ref();
    let nrow = cols.first().map(|c| c.len()).unwrap_or(0);
    ensure!(nrow > 0, "Nothing to write to {:?}.", file_name);
    ensure!(cols.iter().all(|c| c.len() == nrow),
        "Columns written to {:?} differ in length: {:?}.", file_name, cols.iter().map(|c| c.len()).collect::<Vec<_>>());

    let file = File::create(file_name)
        .with_context(|| format!("Cannot create {:?}", file_name))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "# {}", header.trim())?;
    for irow in 0 .. nrow {
        let row = cols.iter().map(|c| format!("{:15.6}", c[irow])).join("  ");
        writeln!(out, "  {}", row)?;
    }
    out.flush()?;
    Ok(())
}


/// Sample index followed by one column per band and spin, from eigenvalues `(nbnd, nk, nspin)`.
pub fn band_columns(eigs: &Cube<f64>) -> Vec<Vector<f64>> {
    let (nbnd, nk, nspin) = eigs.dim();
    let mut cols = Vec::with_capacity(1 + nbnd * nspin);
    cols.push(Vector::from_shape_fn(nk, |i| i as f64));
    for spin in eigs.axis_iter(Axis(2)) {
        for band in spin.outer_iter() {
            cols.push(band.to_owned());
        }
    }
    cols
}


/// Write eigenvalues `(nbnd, nk, nspin)` as one row per k-point.
pub fn write_bands_to_txt(file_name: &(impl AsRef<Path> + ?Sized), eigs: &Cube<f64>, comment: &str) -> Result<()> {
    let cols = band_columns(eigs);
    write_columns(file_name, &cols.iter().collect::<Vec<_>>(), comment)
}
