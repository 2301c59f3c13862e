pub mod types;
pub mod comm;
pub mod grid;
pub mod projectability;
pub mod basis;
pub mod fourier;
pub mod interp;
pub mod spectrum;
pub mod dft_data;
pub mod settings;
pub mod pipeline;
pub mod commands;
pub mod cli;

pub use types::Result;
pub use cli::OptProcess;

pub use comm::{
    Comm,
    SerialComm,
    ThreadComm,
};

pub use grid::{
    Grid,
    KIndex,
    RGrid,
    split_index,
};

pub use basis::{
    Basis,
    BasisCorrection,
    OrthogonalBasis,
    NonOrthogonalBasis,
};

pub use fourier::FourierEngine;

pub use dft_data::DftData;

pub use settings::Settings;

pub use pipeline::{
    Pipeline,
    PipelineOutput,
};
