use std::sync::OnceLock;
use clap::{
    Parser,
    builder::styling::{
        AnsiColor,
        Effects,
        Styles,
    },
};
use enum_dispatch::enum_dispatch;

use crate::{
    types::Result,
    commands::{
        run::Run,
        proj::Proj,
        template::Template,
    },
};


pub fn get_style() -> Styles {
    static INSTANCE: OnceLock<Styles> = OnceLock::new();
    INSTANCE.get_or_init(|| {
        Styles::styled()
            .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
            .usage(AnsiColor::Green.on_default()   | Effects::BOLD)
            .literal(AnsiColor::Green.on_default() | Effects::BOLD)
            .placeholder(AnsiColor::BrightBlue.on_default())
            .error(AnsiColor::BrightRed.on_default())
            .valid(AnsiColor::BrightYellow.on_default())
    }).to_owned()
}


#[enum_dispatch]
pub trait OptProcess {
    fn process(&self) -> Result<()>;
}


#[enum_dispatch(OptProcess)]
#[derive(Debug, Parser)]
#[command(name = "rspao",
            about = r"Tight-binding Hamiltonians from DFT projections on pseudo-atomic orbitals,
with Fourier interpolation on dense k-meshes and band paths.",
            version,
            author = "@Ionizing",
            styles = get_style()
            )]
enum Opt {
    Run,

    Proj,

    Template,
}


pub fn run() -> Result<()> {
    Opt::parse().process()
}
