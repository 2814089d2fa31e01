use anyhow::Context;
use cascade_reco::CascadeParams;
use clap::Parser;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Parser)]
struct Args {
    /// path to growth parameters file to write
    parameter_file: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let params = CascadeParams::default();
    let toml_string = params.to_toml_string()?;
    let filename = args.parameter_file.with_extension("toml");
    let mut f = File::create(&filename).with_context(|| format!("can't create {}", filename.display()))?;
    f.write_all(toml_string.as_bytes())?;
    println!("wrote default parameter file to {}", filename.display());
    Ok(())
}
