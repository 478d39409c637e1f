use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use devicetree::edt::{self, Edt, EdtOptions};
use devicetree::gen::{self, GenOptions};
use flexi_logger::Logger;
use log::debug;

/// Generates a C header of devicetree macros from a DTS file and the YAML
/// bindings of its compatibles.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Preprocessed DTS file.
    #[arg(long)]
    dts: PathBuf,

    /// Flags passed to dtc; `-Wno-simple_bus_reg` disables the unit address
    /// check.
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    dtc_flags: String,

    /// Directories to search for YAML bindings.
    #[arg(long, required = true, num_args = 1..)]
    bindings_dirs: Vec<PathBuf>,

    /// Output path for the macro header.
    #[arg(long)]
    header_out: PathBuf,

    /// Output path for the final merged DTS.
    #[arg(long)]
    dts_out: PathBuf,

    /// Output path for the header declaring a `struct device` per node.
    #[arg(long)]
    device_header_out: PathBuf,

    /// Output path for a pickled snapshot of the EDT.
    #[arg(long)]
    edt_pickle_out: Option<PathBuf>,

    /// vendor-prefixes.txt files; may be given more than once.
    #[arg(long)]
    vendor_prefixes: Vec<PathBuf>,

    /// Turn EDT warnings into errors.
    #[arg(long = "edtlib-Werror")]
    edtlib_werror: bool,

    /// Loglevel specification, see
    /// https://docs.rs/flexi_logger/0.27/flexi_logger/struct.LogSpecification.html.
    /// If not set, environment variable $RUST_LOG is used.
    #[arg(long)]
    log_spec: Option<String>,
}

fn edt_options(cli: &Cli) -> Result<EdtOptions> {
    let mut options = EdtOptions {
        warn_reg_unit_address_mismatch: !cli.dtc_flags.contains("-Wno-simple_bus_reg"),
        infer_binding_for_paths: ["/zephyr,user".to_owned()].into(),
        werror: cli.edtlib_werror,
        ..EdtOptions::default()
    };
    for path in &cli.vendor_prefixes {
        options
            .vendor_prefixes
            .extend(edt::load_vendor_prefixes(path)?);
    }
    Ok(options)
}

/// Creates `path` and runs `write` on a buffered writer for it.
fn write_file(path: &Path, write: impl FnOnce(&mut BufWriter<File>) -> Result<()>) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    write(&mut out).with_context(|| format!("writing {}", path.display()))?;
    out.flush()
        .with_context(|| format!("writing {}", path.display()))?;
    debug!("wrote {}", path.display());
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    let options = edt_options(cli)?;
    let edt = Edt::load(&cli.dts, &[], &cli.bindings_dirs, options)
        .with_context(|| format!("building the EDT for {}", cli.dts.display()))?;

    write_file(&cli.dts_out, |out| {
        write!(out, "{}", edt.dt())?;
        Ok(())
    })?;

    write_file(&cli.device_header_out, |out| {
        Ok(gen::write_device_extern(&edt, out)?)
    })?;

    if let Some(path) = &cli.edt_pickle_out {
        write_file(path, |out| Ok(edt::write_pickle(&edt, out)?))?;
    }

    let gen_options = GenOptions::from_env();
    write_file(&cli.header_out, |out| {
        Ok(gen::write_header(&edt, out, &gen_options)?)
    })
}

fn main() {
    let cli = Cli::parse();

    let logger = match &cli.log_spec {
        Some(spec) => Logger::try_with_str(spec),
        None => Logger::try_with_env_or_str("warn"),
    };
    let _handle = match logger.and_then(|logger| logger.start()) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("error: failed to start logger: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run(&cli) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    #[test]
    fn parses_arguments() {
        let cli = Cli::try_parse_from([
            "gen-defines",
            "--dts",
            "zephyr.dts.pre",
            "--dtc-flags",
            "-Wno-simple_bus_reg -Wno-unit_address_vs_reg",
            "--bindings-dirs",
            "a",
            "b",
            "--header-out",
            "devicetree_generated.h",
            "--dts-out",
            "zephyr.dts",
            "--device-header-out",
            "device_extern.h",
            "--edtlib-Werror",
        ])
        .unwrap();

        assert_eq!(cli.bindings_dirs, [PathBuf::from("a"), PathBuf::from("b")]);
        assert!(cli.edtlib_werror);
        assert!(cli.edt_pickle_out.is_none());

        let options = edt_options(&cli).unwrap();
        assert!(!options.warn_reg_unit_address_mismatch);
        assert!(options.werror);
        assert!(options.infer_binding_for_paths.contains("/zephyr,user"));
    }

    #[test]
    fn output_paths_are_required() {
        let full = [
            "gen-defines",
            "--dts",
            "x.dts",
            "--bindings-dirs",
            "bindings",
            "--header-out",
            "x.h",
            "--dts-out",
            "out.dts",
            "--device-header-out",
            "device_extern.h",
        ];
        assert!(Cli::try_parse_from(full).is_ok());

        for flag in ["--bindings-dirs", "--header-out", "--dts-out", "--device-header-out"] {
            let pos = full.iter().position(|&arg| arg == flag).unwrap();
            let args: Vec<&str> = full
                .iter()
                .enumerate()
                .filter(|&(i, _)| i != pos && i != pos + 1)
                .map(|(_, &arg)| arg)
                .collect();
            assert!(Cli::try_parse_from(args).is_err(), "{flag}");
        }
    }

    #[test]
    fn writes_all_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let bindings = dir.path().join("bindings");
        fs::create_dir(&bindings).unwrap();
        fs::write(
            bindings.join("vnd,led.yaml"),
            "description: LED\ncompatible: \"vnd,led\"\nproperties:\n  label:\n    type: string\n",
        )
        .unwrap();
        let dts = dir.path().join("board.dts");
        fs::write(
            &dts,
            "/dts-v1/;\n/ {\n\tled0: led { compatible = \"vnd,led\"; label = \"LED\"; };\n};\n",
        )
        .unwrap();

        let out = |name: &str| dir.path().join(name).to_str().unwrap().to_owned();
        let (header_out, dts_out) = (out("devicetree_generated.h"), out("zephyr.dts"));
        let (device_out, pickle_out) = (out("device_extern.h"), out("edt.pickle"));
        let cli = Cli::try_parse_from([
            "gen-defines",
            "--dts",
            dts.to_str().unwrap(),
            "--bindings-dirs",
            bindings.to_str().unwrap(),
            "--header-out",
            header_out.as_str(),
            "--dts-out",
            dts_out.as_str(),
            "--device-header-out",
            device_out.as_str(),
            "--edt-pickle-out",
            pickle_out.as_str(),
        ])
        .unwrap();
        run(&cli).unwrap();

        let header = fs::read_to_string(&header_out).unwrap();
        assert!(header.contains("#define DT_N_S_led_P_label \"LED\"\n"));
        assert!(header.contains("#define DT_N_NODELABEL_led0 DT_N_S_led\n"));

        let merged = fs::read_to_string(&dts_out).unwrap();
        assert!(merged.starts_with("/dts-v1/;"));

        let externs = fs::read_to_string(&device_out).unwrap();
        assert!(externs.contains("DEVICE_DT_NAME_GET(DT_N_S_led)"));

        let snapshot = edt::read_pickle(File::open(&pickle_out).unwrap()).unwrap();
        assert!(snapshot.nodes.iter().any(|n| n.path == "/led"));
    }

    #[test]
    fn reports_missing_dts() {
        let dir = tempfile::tempdir().unwrap();
        let path = |name: &str| dir.path().join(name).to_str().unwrap().to_owned();
        let (dts, header_out, dts_out) = (path("missing.dts"), path("out.h"), path("out.dts"));
        let device_out = path("device_extern.h");
        let cli = Cli::try_parse_from([
            "gen-defines",
            "--dts",
            dts.as_str(),
            "--bindings-dirs",
            dir.path().to_str().unwrap(),
            "--header-out",
            header_out.as_str(),
            "--dts-out",
            dts_out.as_str(),
            "--device-header-out",
            device_out.as_str(),
        ])
        .unwrap();

        let err = run(&cli).unwrap_err();
        assert!(format!("{err:#}").contains("missing.dts"));
    }
}
