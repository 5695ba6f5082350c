mod comms;
mod store;

use std::fs::{self, File};
use std::path::Path;

use clap::Parser;
use daemonize::Daemonize;
use log::{info, warn};
use she_core::{
    slot, KeyEntry, KeyId, KeyStore, SheCore, SheError, SizeEndianness, SlotMeta, ERC_NO_ERROR,
    KEY_SIZE,
};

use crate::comms::frame::Packet;
use crate::comms::{decode_command, encode_reply, CommsChannel, CommsError};
use crate::store::NvmKeyStore;

/// SHE HSM server: authenticated key provisioning, secure boot
/// verification, deterministic PRNG and AES services over a framed
/// TCP transport.
#[derive(Parser, Debug)]
#[command(author, version, long_about = None)]
#[command(about = "SHE HSM server over a framed TCP transport")]
struct Args {
    /// Listen address
    #[arg(short, long, value_name = "IP:PORT", default_value = "127.0.0.1:5150")]
    addr: String,

    /// Directory holding the persistent key objects
    #[arg(short, long, value_name = "DIR", default_value = "./she-nvm")]
    store_dir: String,

    /// Client namespace served by this instance
    #[arg(short, long, default_value_t = 1)]
    client_id: u8,

    /// Path to a 16-byte file provisioned into the SECRET_KEY slot
    #[arg(long, value_name = "FILE")]
    secret_key_file: Option<String>,

    /// Path to a 16-byte file provisioned into the PRNG_SEED slot
    #[arg(long, value_name = "FILE")]
    prng_seed_file: Option<String>,

    /// Hash the declared bootloader size big-endian instead of the
    /// default little-endian host order
    #[arg(long)]
    boot_size_big_endian: bool,

    /// Keep serving after a client disconnects
    #[arg(short, long)]
    persistent: bool,

    /// Whether to daemonize the app, implies 'persistent'
    #[arg(short, long)]
    daemonize: bool,

    /// Daemonize working directory, pid file and logs will be placed here
    #[arg(short = 'r', long, default_value = "/tmp")]
    daemonize_root: String,
}

/// Installs a 16-byte key file into a slot before serving starts.
fn provision_slot(
    store: &mut NvmKeyStore,
    client_id: u8,
    slot_id: u8,
    path: &str,
) -> std::io::Result<()> {
    let bytes = fs::read(path)?;
    if bytes.len() != KEY_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{} holds {} bytes, expected {}", path, bytes.len(), KEY_SIZE),
        ));
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&bytes);
    store
        .add_object(KeyEntry {
            id: KeyId::she(client_id, slot_id),
            meta: SlotMeta::default(),
            key,
        })
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "keystore write failed"))?;
    info!("provisioned slot {:#x} from {}", slot_id, path);
    Ok(())
}

fn process_requests(
    comms: &mut CommsChannel,
    core: &mut SheCore<NvmKeyStore>,
) -> Result<(), CommsError> {
    loop {
        let packet = match comms.get_request()? {
            Some(packet) => packet,
            // Graceful disconnect.
            None => return Ok(()),
        };

        let (rc, payload) = match decode_command(packet.action, &packet.payload) {
            Ok(cmd) => match core.handle(cmd) {
                Ok(reply) => (ERC_NO_ERROR, encode_reply(&reply)),
                Err(err) => {
                    warn!("action {:#06x} failed: {:?}", packet.action, err);
                    (err.code(), Vec::new())
                }
            },
            Err(_) => {
                warn!("malformed request for action {:#06x}", packet.action);
                (SheError::BadArgs.code(), Vec::new())
            }
        };

        comms.send_reply(&Packet::reply(packet.action, rc, payload))?;
    }
}

fn daemonize(daemonize_root: String) -> std::io::Result<()> {
    let root = fs::canonicalize(daemonize_root)?;
    let pid_file = root.join("she-hsm.pid").to_string_lossy().to_string();
    let out_file = root.join("she-hsm.out").to_string_lossy().to_string();
    let err_file = root.join("she-hsm.err").to_string_lossy().to_string();
    let root = root.to_string_lossy().to_string();

    let stdout = File::create(&out_file)?;
    let stderr = File::create(&err_file)?;

    info!("pidfile: {}, logs: {}, {}", pid_file, out_file, err_file);

    let daemonize = Daemonize::new()
        .pid_file(pid_file)
        .working_directory(root)
        .stdout(stdout)
        .stderr(stderr);

    match daemonize.start() {
        Ok(_) => info!("daemonization successful"),
        Err(e) => panic!("daemonization failed: {}", e),
    }

    Ok(())
}

fn main() -> std::io::Result<()> {
    env_logger::init();
    let mut args = Args::parse();

    if args.daemonize {
        // A daemon without persistent makes little sense.
        args.persistent = true;
        daemonize(args.daemonize_root.clone())?;
    }

    let mut store = NvmKeyStore::open(Path::new(&args.store_dir))?;
    if let Some(path) = &args.secret_key_file {
        provision_slot(&mut store, args.client_id, slot::SECRET_KEY, path)?;
    }
    if let Some(path) = &args.prng_seed_file {
        provision_slot(&mut store, args.client_id, slot::PRNG_SEED, path)?;
    }

    let endianness = if args.boot_size_big_endian {
        SizeEndianness::Big
    } else {
        SizeEndianness::Little
    };
    let mut core = SheCore::with_endianness(store, args.client_id, endianness);

    let mut comms = CommsChannel::bind(&args.addr)?;
    info!("listening on {}", args.addr);

    loop {
        comms.accept()?;
        match process_requests(&mut comms, &mut core) {
            Ok(()) => info!("client disconnected"),
            Err(err) => warn!("session aborted: {:?}", err),
        }
        // The SHE context is per session; keys, counters and the PRNG
        // seed live on in the store.
        core.reset();
        if !args.persistent {
            return Ok(());
        }
    }
}
