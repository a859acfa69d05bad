use clap::*;
use clap_num::maybe_hex;
use exhume_qcow::{QcowError, QcowFile};
use log::{debug, error, info, LevelFilter};

fn process_file(
    file_path: &str,
    password: Option<&String>,
    size: u64,
    offset: u64,
    show_info: bool,
    json: bool,
) -> exhume_qcow::Result<()> {
    let mut reader = QcowFile::new();
    if let Some(password) = password {
        reader.set_password(password)?;
    }

    info!("Processing the file '{}' in 'qcow' format...", file_path);
    reader.open(file_path)?;

    if show_info {
        if json {
            let info = reader.info()?;
            match serde_json::to_string_pretty(&info) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("Could not serialize the image information: {}", e),
            }
        } else {
            debug!("------------------------------------------------------------");
            reader.print_info()?;
            debug!("------------------------------------------------------------");
        }
    }

    let offset = i64::try_from(offset).map_err(|_| {
        QcowError::InvalidArgument(format!("offset 0x{:x} out of bounds", offset))
    })?;
    let size = usize::try_from(size)
        .map_err(|_| QcowError::InvalidArgument(format!("size {} out of bounds", size)))?;

    let bytes = reader.read_at(size, offset)?;
    debug!("Read {} bytes at offset 0x{:x}", bytes.len(), offset);
    let result = String::from_utf8_lossy(&bytes);
    println!("{}", result);

    reader.close();
    Ok(())
}

fn main() {
    let matches = Command::new("exhume_qcow")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Exhume a body of data from QCOW disk images.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The path to the QCOW image."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_parser(maybe_hex::<u64>)
                .required(true)
                .help("The size (in bytes) to read."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .required(false)
                .help("Read at a specific offset."),
        )
        .arg(
            Arg::new("password")
                .short('p')
                .long("password")
                .value_parser(value_parser!(String))
                .required(false)
                .help("Password of an AES encrypted image."),
        )
        .arg(
            Arg::new("info")
                .short('i')
                .long("info")
                .action(ArgAction::SetTrue)
                .help("Display the image header information."),
        )
        .arg(
            Arg::new("json")
                .short('j')
                .long("json")
                .action(ArgAction::SetTrue)
                .requires("info")
                .help("Output the image information as JSON."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    let log_level_str = matches
        .get_one::<String>("log_level")
        .map(String::as_str)
        .unwrap_or("info");
    let level_filter = match log_level_str {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    env_logger::Builder::new().filter_level(level_filter).init();

    let Some(file_path) = matches.get_one::<String>("body") else {
        error!("Missing the path to the QCOW image.");
        std::process::exit(1);
    };
    let size = matches.get_one::<u64>("size").copied().unwrap_or(0);
    let offset = matches.get_one::<u64>("offset").copied().unwrap_or(0);
    let password = matches.get_one::<String>("password");
    let show_info = matches.get_flag("info");
    let json = matches.get_flag("json");

    if let Err(e) = process_file(file_path, password, size, offset, show_info, json) {
        error!("{}", e);
        std::process::exit(1);
    }
}
