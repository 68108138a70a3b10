//! NetMount server - access host directories from MS-DOS/FreeDOS clients as
//! remote drives.
//!
//! Usage:
//!   netmount-server [options] <letter>=<root-path>[,option=value...] ...
//!
//! Examples:
//!   netmount-server C=/srv/dos
//!   netmount-server --bind-port=12200 C=/srv/dos,readonly=1,label=GAMES
//!   netmount-server --slip-dev=/dev/ttyUSB0 --slip-speed=115200 D=/srv/dos
//!
//! Share options: name_conversion=OFF|RAM, attrs=AUTO|IGNORE|NATIVE|EXTENDED,
//! readonly=0|1, label=<text>.

mod serial;
mod slip;
mod udp;

use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, ensure, Context};
use clap::Parser;
use time::macros::format_description;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::time::UtcTime;

use netmount_core::fs::NameConversion;
use netmount_core::proto::PROTO_UDP_PORT;
use netmount_core::{serve, Dispatcher, ShareConfig, SharedDrive, Transport, TranslitMap};

use crate::slip::SlipTransport;
use crate::udp::UdpTransport;

/// NetMount server
#[derive(Parser, Debug)]
#[command(name = "netmount-server", version)]
#[command(about = "Share host directories with MS-DOS/FreeDOS clients as remote drives")]
struct Args {
    /// IP address to bind; all addresses by default
    #[arg(long, default_value = "0.0.0.0")]
    bind_addr: Ipv4Addr,

    /// UDP port to listen on
    #[arg(long, default_value_t = PROTO_UDP_PORT)]
    bind_port: u16,

    /// Serial device for the built-in SLIP transport (replaces the UDP socket)
    #[arg(long)]
    slip_dev: Option<PathBuf>,

    /// Serial line speed in baud
    #[arg(long, default_value_t = 115_200)]
    slip_speed: u32,

    /// Enable RTS/CTS hardware flow control on the serial line
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    slip_rts_cts: u8,

    /// Log verbosity, 0 (errors only) to 7 (everything)
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u8).range(0..=7))]
    log_level: u8,

    /// Unicode to ASCII transliteration map file for 8.3 name mapping
    #[arg(long)]
    translit_map_path: Option<PathBuf>,

    /// Share definitions: <letter>=<root-path>[,option=value...]
    #[arg(required = true, value_name = "SHARE")]
    shares: Vec<String>,
}

/// The stop flag raised by the signal handlers.
static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop_signal(_signum: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> io::Result<()> {
    let handler: extern "C" fn(libc::c_int) = handle_stop_signal;
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        // no SA_RESTART: blocking waits must return EINTR so the serve loop
        // observes the stop flag
        action.sa_flags = 0;
        for signal in [libc::SIGINT, libc::SIGTERM, libc::SIGQUIT] {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

fn init_logging(level: u8) {
    let filter = match level {
        0 | 1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 | 4 => LevelFilter::INFO,
        5 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let timer = UtcTime::new(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    ));
    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_timer(timer)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Consumes characters up to `delimiter`, honoring `\` escapes. `offset` is
/// left on the delimiter (or at the end of the input).
fn get_token(input: &str, delimiter: char, offset: &mut usize) -> String {
    let rest = &input[*offset..];
    let mut out = String::new();
    let mut consumed = rest.len();
    let mut escape = false;

    for (i, ch) in rest.char_indices() {
        if escape {
            out.push(ch);
            escape = false;
        } else if ch == '\\' {
            escape = true;
        } else if ch == delimiter {
            consumed = i;
            break;
        } else {
            out.push(ch);
        }
    }

    *offset += consumed;
    out
}

/// Parses `<letter>=<root>[,option=value...]` into a drive number and config.
fn parse_share(definition: &str) -> anyhow::Result<(u8, ShareConfig)> {
    let mut chars = definition.chars();
    let (Some(letter), Some('=')) = (chars.next(), chars.next()) else {
        bail!("invalid share definition \"{definition}\"");
    };
    let letter = letter.to_ascii_uppercase();
    ensure!(
        ('C'..='Z').contains(&letter),
        "invalid DOS drive \"{letter}\": valid drives are in the C - Z range"
    );
    let drive_num = letter as u8 - b'A';

    let mut offset = 2;
    let root = get_token(definition, ',', &mut offset);
    ensure!(!root.is_empty(), "missing root path in \"{definition}\"");
    let mut config = ShareConfig::new(root);

    while offset < definition.len() {
        offset += 1; // skip ','
        let option = get_token(definition, '=', &mut offset);
        ensure!(
            offset < definition.len(),
            "missing value for share option \"{option}\""
        );
        offset += 1; // skip '='
        let value = get_token(definition, ',', &mut offset);

        match option.as_str() {
            "name_conversion" => {
                config.name_conversion = value.parse().map_err(anyhow::Error::msg)?;
            }
            "attrs" => {
                config.attr_storage = value.parse().map_err(anyhow::Error::msg)?;
            }
            "readonly" => {
                config.read_only = match value.as_str() {
                    "0" => false,
                    "1" => true,
                    other => bail!("invalid readonly value \"{other}\", expected 0 or 1"),
                };
            }
            "label" => {
                config.label = Some(value);
            }
            other => bail!("unknown share option \"{other}\""),
        }
    }

    Ok((drive_num, config))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level);

    let translit = Rc::new(match &args.translit_map_path {
        Some(path) => TranslitMap::load(path)?,
        None => TranslitMap::new(),
    });

    let mut dispatcher = Dispatcher::new();
    for definition in &args.shares {
        let (drive_num, config) = parse_share(definition)?;
        let root = config.root.clone();
        let drive = SharedDrive::new(config, Rc::clone(&translit))
            .with_context(|| format!("failed to resolve path \"{}\"", root.display()))?;
        dispatcher
            .mount(drive_num, drive)
            .map_err(anyhow::Error::msg)?;
    }
    ensure!(dispatcher.has_shares(), "no shared drive defined");

    for (drive_num, drive) in dispatcher.shares() {
        let mut notes = Vec::new();
        if drive.is_read_only() {
            notes.push("read-only");
        }
        if drive.name_conversion() == NameConversion::Off {
            notes.push("name_conversion=OFF");
        }
        let notes = if notes.is_empty() {
            String::new()
        } else {
            format!(" ({})", notes.join(", "))
        };
        println!(
            " {}: => {}{notes}",
            (b'A' + drive_num) as char,
            drive.root().display()
        );
    }

    install_signal_handlers().context("failed to install signal handlers")?;

    let mut transport: Box<dyn Transport> = match &args.slip_dev {
        Some(device) => {
            info!(
                "SLIP transport on {} at {} baud{}",
                device.display(),
                args.slip_speed,
                if args.slip_rts_cts != 0 { " (RTS/CTS)" } else { "" }
            );
            Box::new(
                SlipTransport::open(device, args.slip_speed, args.slip_rts_cts != 0)
                    .with_context(|| format!("failed to open \"{}\"", device.display()))?,
            )
        }
        None => {
            let transport = UdpTransport::bind(args.bind_addr, args.bind_port)
                .with_context(|| format!("failed to bind {}:{}", args.bind_addr, args.bind_port))?;
            info!("listening on {}:{}", args.bind_addr, args.bind_port);
            Box::new(transport)
        }
    };

    serve(&mut dispatcher, transport.as_mut(), &STOP)?;
    info!("server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use netmount_core::AttrStorage;

    #[test]
    fn test_get_token() {
        let mut offset = 0;
        assert_eq!(get_token("abc,def", ',', &mut offset), "abc");
        assert_eq!(offset, 3);

        // escaped delimiters are part of the token
        let mut offset = 0;
        assert_eq!(get_token("a\\,b,c", ',', &mut offset), "a,b");
        assert_eq!(offset, 4);

        let mut offset = 0;
        assert_eq!(get_token("nodelim", ',', &mut offset), "nodelim");
        assert_eq!(offset, 7);
    }

    #[test]
    fn test_parse_share_minimal() {
        let (num, config) = parse_share("C=/srv/dos").unwrap();
        assert_eq!(num, 2);
        assert_eq!(config.root, PathBuf::from("/srv/dos"));
        assert!(!config.read_only);
        assert_eq!(config.name_conversion, NameConversion::Ram);
        assert_eq!(config.attr_storage, AttrStorage::Auto);
        assert!(config.label.is_none());
    }

    #[test]
    fn test_parse_share_options() {
        let (num, config) =
            parse_share("z=/data,name_conversion=OFF,attrs=EXTENDED,readonly=1,label=Games")
                .unwrap();
        assert_eq!(num, 25);
        assert_eq!(config.name_conversion, NameConversion::Off);
        assert_eq!(config.attr_storage, AttrStorage::Extended);
        assert!(config.read_only);
        assert_eq!(config.label.as_deref(), Some("Games"));
    }

    #[test]
    fn test_parse_share_rejects_bad_input() {
        assert!(parse_share("A=/tmp").is_err()); // local drives stay local
        assert!(parse_share("1=/tmp").is_err());
        assert!(parse_share("C").is_err());
        assert!(parse_share("C=").is_err());
        assert!(parse_share("C=/tmp,name_conversion=DISK").is_err());
        assert!(parse_share("C=/tmp,readonly=yes").is_err());
        assert!(parse_share("C=/tmp,bogus=1").is_err());
        assert!(parse_share("C=/tmp,readonly").is_err());
    }

    #[test]
    fn test_cli_parsing() {
        let args = Args::try_parse_from([
            "netmount-server",
            "--bind-port=9999",
            "--log-level=6",
            "C=/srv/dos",
            "D=/srv/other,readonly=1",
        ])
        .unwrap();
        assert_eq!(args.bind_port, 9999);
        assert_eq!(args.log_level, 6);
        assert_eq!(args.shares.len(), 2);

        assert!(Args::try_parse_from(["netmount-server"]).is_err());
        assert!(Args::try_parse_from(["netmount-server", "--log-level=9", "C=/x"]).is_err());
    }
}
