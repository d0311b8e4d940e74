//! Command-line front end for the linker. Parses the `ld`-compatible
//! surface, infers the emulation when `-m` is absent, drives the pass
//! pipeline, and writes the finished image to disk.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context as _};
use clap::{ArgAction, CommandFactory, FromArgMatches, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rvld::context::{Context, Options};
use rvld::file::{machine_type, File, MachineType};
use rvld::passes::{self, InputArg};

#[derive(Debug, Parser)]
#[command(name = "rvld", about = "A static linker for RISC-V 64", disable_version_flag = true)]
struct Cli {
    /// Write the output to FILE
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<String>,

    /// Target emulation; only elf64lriscv is accepted
    #[arg(short = 'm', value_name = "EMULATION")]
    emulation: Option<String>,

    /// Add DIR to the library search path
    #[arg(short = 'L', long = "library-path", value_name = "DIR")]
    library_paths: Vec<PathBuf>,

    /// Link against libNAME.a
    #[arg(short = 'l', value_name = "NAME")]
    libraries: Vec<String>,

    /// Print version information and exit
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    /// Input relocatable objects and archives
    #[arg(value_name = "FILE")]
    inputs: Vec<String>,

    // The rest are accepted for compatibility with compiler drivers and
    // ignored.
    #[arg(long = "sysroot", hide = true)]
    sysroot: Option<String>,
    #[arg(long = "static", hide = true, action = ArgAction::SetTrue)]
    link_static: bool,
    #[arg(long = "plugin", hide = true)]
    plugin: Option<String>,
    #[arg(long = "plugin-opt", hide = true)]
    plugin_opt: Vec<String>,
    #[arg(long = "as-needed", hide = true, action = ArgAction::SetTrue)]
    as_needed: bool,
    #[arg(long = "start-group", hide = true, action = ArgAction::SetTrue)]
    start_group: bool,
    #[arg(long = "end-group", hide = true, action = ArgAction::SetTrue)]
    end_group: bool,
    #[arg(long = "hash-style", hide = true)]
    hash_style: Option<String>,
    #[arg(long = "build-id", hide = true, num_args = 0..=1)]
    build_id: Option<String>,
    #[arg(short = 's', hide = true, action = ArgAction::SetTrue)]
    strip_all: bool,
    #[arg(long = "no-relax", hide = true, action = ArgAction::SetTrue)]
    no_relax: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("rvld: fatal: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Lexically normalize a search path: drop `.` components and collapse
/// `..` against the component before it. A `..` at the start (or after
/// another surviving `..`) stays; one directly under the root vanishes.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) => {}
                _ => out.push(Component::ParentDir),
            },
            _ => out.push(component),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(Component::CurDir);
    }
    out
}

fn run() -> anyhow::Result<()> {
    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches)?;

    if cli.version {
        println!("rvld {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Positional files and -l options interleave on a linker command line,
    // and their order decides file priority; merge them back by argv index.
    let mut ordered: Vec<(usize, InputArg)> = Vec::new();
    if let Some(indices) = matches.indices_of("inputs") {
        for (idx, value) in indices.zip(cli.inputs.iter()) {
            ordered.push((idx, InputArg::Path(value.clone())));
        }
    }
    if let Some(indices) = matches.indices_of("libraries") {
        for (idx, value) in indices.zip(cli.libraries.iter()) {
            ordered.push((idx, InputArg::Library(value.clone())));
        }
    }
    ordered.sort_by_key(|&(idx, _)| idx);
    let inputs: Vec<InputArg> = ordered.into_iter().map(|(_, arg)| arg).collect();

    let mut emulation = match cli.emulation.as_deref() {
        Some("elf64lriscv") => MachineType::Riscv64,
        Some(name) => bail!("unknown -m argument: {name}"),
        None => MachineType::None,
    };

    // Without -m, take the machine type of the first input that has one.
    if emulation == MachineType::None {
        for arg in &inputs {
            let InputArg::Path(path) = arg else { continue };
            let file =
                File::open(Path::new(path)).with_context(|| format!("cannot open {path}"))?;
            emulation = machine_type(file.contents());
            if emulation != MachineType::None {
                break;
            }
        }
    }
    if emulation != MachineType::Riscv64 {
        bail!("unknown emulation type");
    }

    let opts = Options::builder()
        .output(cli.output.unwrap_or_else(|| "a.out".to_string()))
        .emulation(emulation)
        .library_paths(cli.library_paths.iter().map(|p| normalize(p)).collect())
        .build();

    let mut ctx = Context::new(opts);
    passes::read_input_files(&mut ctx, &inputs)?;
    let buf = passes::link(&mut ctx)?;

    let output = ctx.opts.output.clone();
    fs::write(&output, &buf).with_context(|| format!("cannot write {output}"))?;
    fs::set_permissions(&output, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("cannot mark {output} executable"))?;

    info!(output, bytes = buf.len(), "wrote executable");
    Ok(())
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalize_collapses_lexically() {
        let clean = |p: &str| normalize(Path::new(p));
        assert_eq!(clean("foo/../bar"), PathBuf::from("bar"));
        assert_eq!(clean("/usr/lib/../lib64"), PathBuf::from("/usr/lib64"));
        assert_eq!(clean("a/b/../../c"), PathBuf::from("c"));
        assert_eq!(clean("./lib/"), PathBuf::from("lib"));
        assert_eq!(clean("../x"), PathBuf::from("../x"));
        assert_eq!(clean("/.."), PathBuf::from("/"));
        assert_eq!(clean(""), PathBuf::from("."));
    }
}
