mod alloc;
mod driver;
mod freq;
mod insn_form;
mod isa;
mod machine_params;
mod register_file;
mod service;
mod settings;

use std::path::PathBuf;

use clap::Parser;

use portbench_rpc::tls;

use driver::Driver;
use freq::FrequencyGuard;
use machine_params::SIMULATED_PARAMS;
use settings::Settings;

#[derive(Debug, Parser)]
#[command(
    name = "portbench-server",
    version,
    about = "Instruction-throughput measurement server.\n\n\
             Measures the steady-state cycles per instruction of arbitrary\n\
             instruction mixes on a frequency-pinned core and exposes the\n\
             driver over a mutually-authenticated RPC channel."
)]
struct Opt {
    /// The port to listen on for requests.
    #[arg(long, default_value_t = 42424)]
    port: u16,

    /// Folder containing the SSL key, certificate and CA file
    /// (bootstrapped with a self-signed certificate if missing).
    #[arg(long, default_value = "./ssl")]
    sslpath: PathBuf,

    /// The instruction set architecture to benchmark (default: the
    /// machine's own, from `uname -m`).
    #[arg(long, value_name = "ARCH")]
    isa: Option<String>,

    /// The core on which the experiments are executed.
    #[arg(long, default_value_t = 5)]
    core: u32,

    /// The number of ports of the tested microarchitecture.
    #[arg(short = 'n', long, value_name = "N")]
    numports: u32,

    /// Use IACA instead of actual runs.
    #[arg(long)]
    iaca: bool,

    /// Use Ithemal instead of actual runs (needs the Ithemal environment).
    #[arg(long)]
    ithemal: bool,

    /// Skip frequency pinning; measurements get no stability data.
    #[arg(long)]
    noroot: bool,

    /// Directory with per-ISA instruction-form files.
    #[arg(long, default_value = "./input")]
    inputdir: PathBuf,

    /// Determine the loop body length in a more precise way. Might take a
    /// while!
    #[arg(long, overrides_with = "no_precise")]
    precise: bool,

    #[arg(long = "no-precise", hide = true)]
    no_precise: bool,

    /// Redo the initial determination of the loop body length.
    #[arg(long = "newSU", overrides_with = "no_new_su")]
    new_su: bool,

    #[arg(long = "no-newSU", hide = true)]
    no_new_su: bool,
}

fn main() {
    env_logger::init();
    let opt = Opt::parse();

    let simulated_backend = opt.iaca || opt.ithemal;
    if !nix::unistd::Uid::effective().is_root() && !simulated_backend && !opt.noroot {
        eprintln!(
            "portbench-server requires root privileges for setting and accessing \
             cpu frequency information! Please restart appropriately."
        );
        std::process::exit(1);
    }
    if isa::find_in_path("taskset").is_none() {
        log::warn!(
            "the taskset command is not available, experiment execution cannot be \
             pinned to a specific core"
        );
    }

    let ssl = match tls::ensure_ssl_dir(&opt.sslpath) {
        Ok(ssl) => ssl,
        Err(err) => {
            eprintln!("Could not set up TLS material: {err}");
            std::process::exit(1);
        }
    };

    let mut settings = Settings::new(opt.core, opt.port, opt.inputdir.clone());
    settings.precise_setup = opt.precise;
    settings.recalibrate = opt.new_su;
    if let Err(err) = std::fs::create_dir_all(&settings.output_dir) {
        eprintln!(
            "Could not create output directory {}: {err}",
            settings.output_dir.display()
        );
        std::process::exit(1);
    }

    let isa_name = if opt.iaca {
        "IACAx86_64".to_owned()
    } else if opt.ithemal {
        "Ithemalx86_64".to_owned()
    } else {
        match opt.isa {
            Some(name) => name,
            None => match isa::native_isa_name() {
                Ok(name) => {
                    log::info!("identified ISA: {name:?}");
                    name
                }
                Err(err) => {
                    eprintln!("Could not identify the machine's ISA: {err}");
                    std::process::exit(1);
                }
            },
        }
    };
    let isa = match isa::create_isa(&isa_name) {
        Some(isa) => isa,
        None => {
            eprintln!("Unsupported ISA: {isa_name:?}");
            std::process::exit(1);
        }
    };
    let simulated = isa.is_simulated();
    settings.no_root = simulated || opt.noroot;

    let forms = match driver::load_insn_files(&settings.input_dir.join(isa.insn_dir())) {
        Ok(forms) if !forms.is_empty() => forms,
        Ok(_) => {
            eprintln!(
                "No instruction forms found under {}",
                settings.input_dir.join(isa.insn_dir()).display()
            );
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("Could not load instruction forms: {err}");
            std::process::exit(1);
        }
    };
    log::info!("loaded {} instruction forms for {}", forms.len(), isa.name());

    // Keep the core pinned for the whole server lifetime; restored on
    // shutdown and on Ctrl+C.
    let _freq_guard = if settings.no_root {
        None
    } else {
        match FrequencyGuard::acquire(&settings) {
            Ok(guard) => Some(guard),
            Err(err) => {
                eprintln!("Could not pin the core frequency: {err}");
                std::process::exit(1);
            }
        }
    };

    let params = if simulated {
        settings.default_num_repetitions = 1;
        SIMULATED_PARAMS
    } else {
        match machine_params::load_or_calibrate(&settings, isa.as_ref(), &forms) {
            Ok(params) => params,
            Err(err) => {
                eprintln!("Machine calibration failed: {err}");
                std::process::exit(1);
            }
        }
    };

    let driver = Driver::new(settings, isa, forms, opt.numports, params);
    log::info!("starting server on port {}", opt.port);
    if let Err(err) = run_server(driver, opt.port, &ssl) {
        eprintln!("Server failed: {err}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run_server(
    driver: Driver,
    port: u16,
    ssl: &portbench_rpc::SslInfo,
) -> Result<(), service::ServeError> {
    service::serve(driver, port, ssl).await
}
