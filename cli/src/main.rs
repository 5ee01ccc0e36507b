//! fgclean CLI
//!
//! Command-line interface for the fgclean library.
//! Runs polynomial or PCA foreground removal on FITS cubes.

use std::path::{Path, PathBuf};
use std::process;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use fgclean_lib::{
    fits_io::{write_cube, ChannelSource, FitsCube, FitsDirectorySink},
    polyfit::{DomainErrorPolicy, FitConfig, FitMode},
    utils::{self, presets},
    CleanError, FrequencyAxis, PcaPipeline, PolyFitConfig, PolyFitPipeline, Result,
};

#[cfg(feature = "image")]
use fgclean_lib::{
    preview::{save_plane, ColorMap, Normalization, PreviewOptions},
    spectral::SpectralTransform,
};

fn input_arg() -> Arg {
    Arg::new("input")
        .help("Input FITS cube")
        .value_name("INPUT")
        .required(true)
        .index(1)
}

fn output_arg() -> Arg {
    Arg::new("output")
        .help("Output directory")
        .value_name("OUTPUT")
        .required(true)
        .index(2)
}

fn polyfit_command() -> Command {
    Command::new("polyfit")
        .about("Remove a per-pixel polynomial trend across frequency in the Fourier plane")
        .arg(input_arg())
        .arg(output_arg())
        .arg(
            Arg::new("degree")
                .long("degree")
                .short('d')
                .help("Polynomial degree")
                .value_name("D")
                .required(true)
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("loglog")
                .long("loglog")
                .help("Fit ln(value + offset) against ln(frequency)")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("freq-start")
                .long("freq-start")
                .help("First channel frequency in MHz")
                .value_name("MHZ")
                .value_parser(value_parser!(f64))
                .requires("freq-stop")
                .requires("freq-step")
                .conflicts_with("preset"),
        )
        .arg(
            Arg::new("freq-stop")
                .long("freq-stop")
                .help("Last channel frequency in MHz")
                .value_name("MHZ")
                .value_parser(value_parser!(f64))
                .requires("freq-start"),
        )
        .arg(
            Arg::new("freq-step")
                .long("freq-step")
                .help("Channel spacing in MHz")
                .value_name("MHZ")
                .value_parser(value_parser!(f64))
                .requires("freq-start"),
        )
        .arg(
            Arg::new("preset")
                .long("preset")
                .help("Named frequency axis (sdc3a, sdc3a-low)")
                .value_name("NAME"),
        )
        .arg(
            Arg::new("scratch")
                .long("scratch")
                .help("Scratch directory for Fourier planes (default OUTPUT/TEMP)")
                .value_name("DIR"),
        )
        .arg(
            Arg::new("keep-scratch")
                .long("keep-scratch")
                .help("Do not delete the scratch directory after a successful run")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("positivity-pad")
                .long("positivity-pad")
                .help("Constant added to |min| to keep log-log series positive")
                .value_name("X")
                .default_value("1.0")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("abort-on-bad-pixel")
                .long("abort-on-bad-pixel")
                .help("Fail the run instead of zeroing pixels that cannot be fitted")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("save-coefficients")
                .long("save-coefficients")
                .help("Write coefficients_real.fits and coefficients_imag.fits to OUTPUT")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .short('j')
                .help("Worker threads for the pixel fits (default: all cores)")
                .value_name("N")
                .value_parser(value_parser!(usize)),
        )
}

fn pca_command() -> Command {
    Command::new("pca")
        .about("Subtract the leading principal components across frequency")
        .arg(input_arg())
        .arg(output_arg())
        .arg(
            Arg::new("modes")
                .long("modes")
                .short('n')
                .help("Number of foreground modes to remove")
                .value_name("N")
                .required(true)
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("save-foreground")
                .long("save-foreground")
                .help("Also write pca_foreground.fits and pca_amplitudes.fits")
                .action(ArgAction::SetTrue),
        )
}

fn info_command() -> Command {
    Command::new("info")
        .about("Show cube shape and frequency metadata")
        .arg(input_arg())
}

#[cfg(feature = "image")]
fn preview_command() -> Command {
    Command::new("preview")
        .about("Render one channel as a PNG")
        .arg(input_arg())
        .arg(
            Arg::new("png")
                .help("Output image")
                .value_name("PNG")
                .required(true)
                .index(2),
        )
        .arg(
            Arg::new("channel")
                .long("channel")
                .short('c')
                .help("Channel index")
                .value_name("I")
                .default_value("0")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("fourier")
                .long("fourier")
                .help("Show the log power of the channel's Fourier plane")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("colormap")
                .long("colormap")
                .help("Color map (viridis, inferno, grayscale)")
                .value_name("NAME")
                .default_value("viridis"),
        )
        .arg(
            Arg::new("minmax")
                .long("minmax")
                .help("Scale between min and max instead of the 1st and 99th percentiles")
                .action(ArgAction::SetTrue),
        )
}

fn build_cli() -> Command {
    let cmd = Command::new("fgclean")
        .version(fgclean_lib::VERSION)
        .about("Foreground removal for 21-cm spectral image cubes")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(polyfit_command())
        .subcommand(pca_command())
        .subcommand(info_command());

    #[cfg(feature = "image")]
    let cmd = cmd.subcommand(preview_command());

    cmd
}

/// Frequency axis from the command line, if one was given
fn frequency_axis(matches: &ArgMatches) -> Result<Option<FrequencyAxis>> {
    if let Some(name) = matches.get_one::<String>("preset") {
        let preset = presets::get_preset(name).ok_or_else(|| {
            let known: Vec<&str> = presets::list_presets().iter().map(|p| p.name).collect();
            CleanError::config(
                "preset",
                format!("unknown preset '{}', expected one of {}", name, known.join(", ")),
            )
        })?;
        println!("Using preset {}: {}", preset.name, preset.description);
        return Ok(Some(preset.axis));
    }

    match (
        matches.get_one::<f64>("freq-start"),
        matches.get_one::<f64>("freq-stop"),
        matches.get_one::<f64>("freq-step"),
    ) {
        (Some(&start), Some(&stop), Some(&step)) => Ok(Some(FrequencyAxis::new(start, stop, step)?)),
        _ => Ok(None),
    }
}

fn configure_threads(matches: &ArgMatches) -> Result<()> {
    if let Some(&threads) = matches.get_one::<usize>("threads") {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|e| CleanError::config("threads", e.to_string()))?;
        log::info!("Using {} worker threads", threads);
    }
    Ok(())
}

fn run_polyfit(matches: &ArgMatches) -> Result<()> {
    let input = path_arg(matches, "input");
    let output = path_arg(matches, "output");
    configure_threads(matches)?;

    let mut cube = FitsCube::open(&input)?;
    let axis = utils::resolve_frequency_axis(&mut cube, frequency_axis(matches)?)?;

    let mode = if matches.get_flag("loglog") {
        FitMode::LogLog
    } else {
        FitMode::Linear
    };
    let degree = matches.get_one::<usize>("degree").copied().unwrap_or(3);
    let pad = matches.get_one::<f64>("positivity-pad").copied().unwrap_or(1.0);
    let policy = if matches.get_flag("abort-on-bad-pixel") {
        DomainErrorPolicy::Abort
    } else {
        DomainErrorPolicy::Isolate
    };
    let fit = FitConfig::new(degree, mode)
        .with_positivity_pad(pad)?
        .with_policy(policy);

    let scratch = matches
        .get_one::<String>("scratch")
        .map(PathBuf::from)
        .unwrap_or_else(|| output.join("TEMP"));

    let mut config = PolyFitConfig::new(fit, axis, scratch)?;
    config.keep_scratch = matches.get_flag("keep-scratch");
    if matches.get_flag("save-coefficients") {
        config.save_coefficients = Some(output.clone());
    }

    let shape = cube.shape();
    println!(
        "Cleaning {} ({}) with a degree {} {} fit",
        input.display(),
        shape,
        degree,
        mode.name()
    );
    println!(
        "Each component cube needs {} in memory",
        utils::format_bytes(utils::component_cube_bytes(shape.channels, shape.side))
    );

    let mut sink = FitsDirectorySink::create(&output, "data_clean")?;
    let report = PolyFitPipeline::new(config)?.run(&mut cube, &mut sink)?;

    println!("{}", report.summary());
    Ok(())
}

fn run_pca(matches: &ArgMatches) -> Result<()> {
    let input = path_arg(matches, "input");
    let output = path_arg(matches, "output");
    let modes = matches.get_one::<usize>("modes").copied().unwrap_or(1);

    let mut cube = FitsCube::open(&input)?;
    let mut sink = FitsDirectorySink::create(&output, "pca_clean")?;
    let outcome = PcaPipeline::new(modes)?.run_to_sink(&mut cube, &mut sink)?;

    println!("Leading eigenvalues:");
    for (i, (value, ratio)) in outcome
        .decomposition
        .eigenvalues
        .iter()
        .zip(outcome.decomposition.explained_variance_ratio())
        .take(modes.max(5))
        .enumerate()
    {
        let marker = if i < modes { "removed" } else { "" };
        println!("  {:>3}: {:>14.6e} {:>9.5}% {}", i, value, ratio * 100.0, marker);
    }

    if matches.get_flag("save-foreground") {
        write_cube(output.join("pca_foreground.fits"), &outcome.model.field)?;
        write_cube(output.join("pca_amplitudes.fits"), &outcome.model.amplitudes)?;
        println!("Saved foreground field and mode amplitudes to {}", output.display());
    }

    println!("Wrote {} cleaned channels to {}", outcome.cleaned.channels(), output.display());
    Ok(())
}

fn run_info(matches: &ArgMatches) -> Result<()> {
    let input = path_arg(matches, "input");
    let mut cube = FitsCube::open(&input)?;
    let shape = cube.shape();

    println!("File:     {}", input.display());
    println!("Shape:    {} (channels x rows x columns)", shape);
    println!(
        "Memory:   {} per component cube",
        utils::format_bytes(utils::component_cube_bytes(shape.channels, shape.side))
    );

    match cube.frequency_metadata() {
        Some(header) => {
            println!(
                "Header:   CRVAL3={} CDELT3={} CRPIX3={} CUNIT3={}",
                header.reference_value, header.step, header.reference_pixel, header.unit
            );
            match header.axis_mhz(shape.channels) {
                Ok(axis) => println!(
                    "Axis:     {} to {} in {} channels",
                    utils::format_frequency(axis.start()),
                    utils::format_frequency(axis.stop()),
                    axis.len()
                ),
                Err(e) => println!("Axis:     {}", e),
            }
        }
        None => println!("Header:   no frequency axis keywords"),
    }

    for preset in presets::list_presets() {
        if preset.axis.len() == shape.channels {
            println!("Matches preset {} ({})", preset.name, preset.description);
        }
    }
    Ok(())
}

#[cfg(feature = "image")]
fn run_preview(matches: &ArgMatches) -> Result<()> {
    let input = path_arg(matches, "input");
    let png = path_arg(matches, "png");
    let channel = matches.get_one::<usize>("channel").copied().unwrap_or(0);

    let colormap_name = matches
        .get_one::<String>("colormap")
        .map(String::as_str)
        .unwrap_or("viridis");
    let colormap = ColorMap::from_name(colormap_name).ok_or_else(|| {
        CleanError::config("colormap", format!("unknown color map '{}'", colormap_name))
    })?;
    let normalization = if matches.get_flag("minmax") {
        Normalization::MinMax
    } else {
        PreviewOptions::default().normalization
    };
    let options = PreviewOptions {
        colormap,
        normalization,
    };

    let mut cube = FitsCube::open(&input)?;
    let side = cube.shape().side;
    let plane = cube.read_channel(channel)?;

    if matches.get_flag("fourier") {
        let fourier = SpectralTransform::new(side)?.forward(&plane)?;
        save_plane(&png, &fgclean_lib::preview::fourier_log_power(&fourier), side, &options)?;
    } else {
        save_plane(&png, &plane, side, &options)?;
    }

    println!("Saved channel {} preview to {}", channel, png.display());
    Ok(())
}

fn path_arg(matches: &ArgMatches, name: &str) -> PathBuf {
    matches
        .get_one::<String>(name)
        .map(|s| Path::new(s).to_path_buf())
        .unwrap_or_default()
}

fn main() {
    let matches = build_cli().get_matches();

    // Default to info-level progress unless RUST_LOG says otherwise
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let result = match matches.subcommand() {
        Some(("polyfit", sub)) => run_polyfit(sub),
        Some(("pca", sub)) => run_pca(sub),
        Some(("info", sub)) => run_info(sub),
        #[cfg(feature = "image")]
        Some(("preview", sub)) => run_preview(sub),
        _ => Ok(()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_polyfit_arguments() {
        let matches = build_cli()
            .try_get_matches_from([
                "fgclean", "polyfit", "cube.fits", "out", "--degree", "3", "--loglog", "--preset",
                "sdc3a",
            ])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "polyfit");
        assert!(sub.get_flag("loglog"));
        assert_eq!(sub.get_one::<usize>("degree"), Some(&3));
        assert_eq!(frequency_axis(sub).unwrap().unwrap().len(), 901);
    }

    #[test]
    fn test_explicit_axis_arguments() {
        let matches = build_cli()
            .try_get_matches_from([
                "fgclean",
                "polyfit",
                "cube.fits",
                "out",
                "--degree",
                "2",
                "--freq-start",
                "100",
                "--freq-stop",
                "104",
                "--freq-step",
                "1",
            ])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        let axis = frequency_axis(sub).unwrap().unwrap();
        assert_eq!(axis.len(), 5);
    }

    #[test]
    fn test_rejects_incomplete_axis_and_missing_degree() {
        assert!(build_cli()
            .try_get_matches_from(["fgclean", "polyfit", "c.fits", "out", "--degree", "2", "--freq-start", "100"])
            .is_err());
        assert!(build_cli()
            .try_get_matches_from(["fgclean", "polyfit", "c.fits", "out"])
            .is_err());
        assert!(build_cli()
            .try_get_matches_from(["fgclean", "pca", "c.fits", "out", "--modes", "x"])
            .is_err());
    }

    #[test]
    fn test_unknown_preset() {
        let matches = build_cli()
            .try_get_matches_from(["fgclean", "polyfit", "c.fits", "out", "-d", "2", "--preset", "lofar"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        assert!(matches!(
            frequency_axis(sub),
            Err(CleanError::InvalidConfig { .. })
        ));
    }
}
