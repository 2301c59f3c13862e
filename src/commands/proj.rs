use std::path::PathBuf;

use clap::Args;
use colored::Colorize;
use log::info;

use crate::{
    OptProcess,
    dft_data::DftData,
    projectability::build_pn,
    types::{
        Result,
        Vector,
    },
};


#[derive(Debug, Args)]
/// Print the projectability of every DFT band onto the PAO basis.
///
/// Bands above the threshold are kept to build the TB Hamiltonian.
pub struct Proj {
    #[arg(short, long, default_value = "./dft.h5")]
    /// HDF5 file with the projected DFT data.
    fpath: PathBuf,

    #[arg(short, long, default_value_t = 0.9)]
    /// Projectability threshold.
    pthr: f64,
}


fn format_report(pn: &Vector<f64>, pthr: f64) -> String {
    let mut output = String::new();
    output.push_str(&format!("  {:>6}  {:>10}\n", "band", "Pn"));
    for (i, p) in pn.iter().enumerate() {
        let value = format!("{:10.6}", p);
        let value = if *p > pthr { value.bright_green() } else { value.bright_red() };
        output.push_str(&format!("  {:6}  {}\n", i + 1, value));
    }

    let bnd = pn.iter().filter(|p| **p > pthr).count();
    output.push_str(&format!(" {} of {} bands above pthr = {}\n",
        bnd.to_string().bright_yellow(), pn.len(), pthr));
    output
}


impl OptProcess for Proj {
    fn process(&self) -> Result<()> {
        let data = DftData::from_h5(&self.fpath)?;
        let pn = build_pn(data.u.view())?;
        info!("Projectability of {} bands on {} orbitals:", data.nbnds(), data.nawf());
        print!("{}", format_report(&pn, self.pthr));
        Ok(())
    }
}
