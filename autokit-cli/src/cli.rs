use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Opt {
    #[arg(long, global = true)]
    /// Path to the autokit JSON configuration. Defaults apply when omitted.
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    /// Override the device type from the configuration (e.g. `raspberrypi4-64`, `fincm3`).
    pub device_type: Option<String>,

    #[arg(long, global = true)]
    /// Override the USB hub port the DUT is attached to.
    pub usb_port: Option<u8>,

    #[command(subcommand)]
    /// Specifies the subcommand to execute.
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Flash an image (raw or xz compressed) to the DUT.
    Flash {
        /// Path to the image file.
        img: PathBuf,

        #[arg(long)]
        /// Power the DUT on once flashing is done.
        power_on: bool,

        #[arg(long)]
        /// Suppress standard output messages for a quieter experience.
        quiet: bool,
    },

    /// Power on the DUT the way its device family needs.
    PowerOn,

    /// Close the DUT serial console and power off the DUT.
    PowerOff,

    /// Read the DUT supply voltage and current draw.
    ReadPower,

    /// List the drives that could be flashed. System drives are never listed.
    ListDestinations {
        #[arg(long)]
        /// Only print paths separated by newline
        no_frills: bool,
    },

    /// Command to generate shell completion
    GenerateCompletion {
        /// Specifies the target shell type for completion
        shell: clap_complete::Shell,
    },
}
