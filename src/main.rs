use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use sbtextc::compile_file;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "sbtextc",
    about = "Compile SBText source into a Scratch 3 .sb3 project",
    version,
    long_about = "sbtextc translates the line-oriented SBText block language into a \
                  Scratch 3 project archive: a project.json block graph plus \
                  MD5-content-addressed costume assets, zipped as .sb3."
)]
struct Cli {
    /// Path to the input .sbtext file.
    input: PathBuf,

    /// Path of the .sb3 archive to write.
    output: PathBuf,

    /// Keep original SVG geometry instead of normalizing costumes to a
    /// 64x64 viewBox.
    #[arg(long)]
    no_svg_scale: bool,
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    compile_file(&cli.input, &cli.output, !cli.no_svg_scale)
        .with_context(|| format!("failed to compile '{}'", cli.input.display()))
}

fn main() {
    let cli = Cli::parse();

    if !cli.input.is_file() {
        eprintln!(
            "{}: Input file not found: '{}'",
            "error".red().bold(),
            cli.input.display()
        );
        process::exit(2);
    }

    if let Err(e) = run(&cli) {
        // `{:#}` prints the context chain on one line:
        // `failed to compile 'x.sbtext': Unknown variable … (line 3, column 5)`
        eprintln!("{}: {e:#}", "error".red().bold());
        process::exit(1);
    }
}
