use anyhow::{bail, Context};
use clap::Parser;
use pretty_hex::PrettyHex;

use mneme::low_level::{
    invalidate_record, write_record, FileMeta, RecordHeader, RecordMagic, SpaceAccountant,
    Storage, FILE_NAME_BYTES,
};
use mneme::Dictionary;

const SECTORS: usize = 8;
const SECTOR_BYTES: u32 = 4096;
const NODES: usize = 64;
const FILES: usize = 16;

type Dict = Dictionary<SECTORS, NODES, FILES>;

/// Maintenance tool for dictionary filesystem flash images.
#[derive(Parser)]
struct Dictool {
    image_file: std::path::PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Create an erased image.
    Format,
    /// Run the boot scan and print the recovered catalog.
    Check,
    /// Hex-dump one sector.
    Dump { sector: u32 },
    /// Append a record for the named file.
    Put {
        name: String,
        #[clap(short, long, default_value_t = 0)]
        element: u16,
        data: String,
    },
    /// Invalidate the record at the given address.
    Rm { address: u32 },
}

struct FlashImage {
    bytes: Vec<u8>,
}

#[derive(Copy, Clone, Debug)]
enum ImageError {
    OutOfRange,
}

impl FlashImage {
    fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("opening image file {}", path.display()))?;
        if bytes.len() != SECTORS * SECTOR_BYTES as usize {
            bail!(
                "image is {} bytes; expected {} ({} sectors of {})",
                bytes.len(),
                SECTORS * SECTOR_BYTES as usize,
                SECTORS,
                SECTOR_BYTES,
            );
        }
        Ok(Self { bytes })
    }

    fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        std::fs::write(path, &self.bytes)
            .with_context(|| format!("writing image file {}", path.display()))
    }
}

impl Storage for FlashImage {
    type Error = ImageError;

    fn read(&self, address: u32, dest: &mut [u8]) -> Result<(), ImageError> {
        let start = address as usize;
        let end = start + dest.len();
        if end > self.bytes.len() {
            return Err(ImageError::OutOfRange);
        }
        dest.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), ImageError> {
        let start = address as usize;
        let end = start + data.len();
        if end > self.bytes.len() {
            return Err(ImageError::OutOfRange);
        }
        self.bytes[start..end].copy_from_slice(data);
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Dictool::parse();

    match args.cmd {
        Cmd::Format => {
            let image = FlashImage { bytes: vec![0xFF; SECTORS * SECTOR_BYTES as usize] };
            image.save(&args.image_file)?;
            println!("formatted {} sectors of {} bytes", SECTORS, SECTOR_BYTES);
        }
        Cmd::Check => {
            let mut image = FlashImage::load(&args.image_file)?;
            let mut dict = Dict::new(SECTOR_BYTES);
            let report = dict.boot(&mut image);
            println!(
                "{} nodes, {} files, outcome {:?}",
                report.nodes, report.files, report.outcome,
            );

            for file in dict.files() {
                let name = match file.first_node {
                    Some(first) => read_name(&image, dict.node(first).address)?,
                    None => String::new(),
                };
                println!("file {:?} (crc {:#06x}, {:?})", name, file.name_crc, file.state);

                let mut next = file.first_node;
                while let Some(id) = next {
                    let node = dict.node(id);
                    println!(
                        "  node at {:#x}: element {}, {} bytes, {:?}",
                        node.address, node.file_element, node.data_length, node.state,
                    );
                    next = node.next;
                }
            }
        }
        Cmd::Dump { sector } => {
            if sector as usize >= SECTORS {
                bail!("no sector {sector}");
            }
            let image = FlashImage::load(&args.image_file)?;
            let start = (sector * SECTOR_BYTES) as usize;
            let slice = &image.bytes[start..start + SECTOR_BYTES as usize];
            println!("{:?}", slice.hex_dump());
        }
        Cmd::Put { name, element, data } => {
            if name.len() > FILE_NAME_BYTES {
                bail!("name longer than {FILE_NAME_BYTES} bytes");
            }
            let mut image = FlashImage::load(&args.image_file)?;
            let mut dict = Dict::new(SECTOR_BYTES);
            let report = dict.boot(&mut image);
            if !dict.is_booted() {
                bail!("image failed its boot scan: {:?}", report.outcome);
            }

            let meta_bytes = if element == 0 { FileMeta::SIZE } else { 0 };
            let span = RecordHeader::SIZE + meta_bytes + data.len() as u32;
            let space = dict.space();
            let slot = (0..SECTORS as u32)
                .map(|s| (space.write_offset(s), space.boundary(s)))
                .find(|(offset, boundary)| offset + span <= *boundary);
            let (offset, _) = match slot {
                Some(slot) => slot,
                None => bail!("no sector has {span} bytes of room"),
            };

            let end = write_record(
                &mut image,
                offset,
                RecordMagic::Valid,
                element,
                name.as_bytes(),
                data.as_bytes(),
            )
            .map_err(|e| anyhow::anyhow!("image access: {e:?}"))?;
            image.save(&args.image_file)?;
            println!("record written at {:#x}..{:#x}", offset, end);
        }
        Cmd::Rm { address } => {
            let mut image = FlashImage::load(&args.image_file)?;
            invalidate_record(&mut image, address)
                .map_err(|e| anyhow::anyhow!("image access: {e:?}"))?;
            image.save(&args.image_file)?;
            println!("record at {:#x} invalidated", address);
        }
    }

    Ok(())
}

fn read_name(image: &FlashImage, first_node_address: u32) -> anyhow::Result<String> {
    let mut buf = [0u8; FILE_NAME_BYTES];
    image
        .read(first_node_address + RecordHeader::SIZE, &mut buf)
        .map_err(|e| anyhow::anyhow!("image access: {e:?}"))?;
    let trimmed = buf.iter().take_while(|&&b| b != 0).copied().collect::<Vec<u8>>();
    Ok(String::from_utf8_lossy(&trimmed).into_owned())
}
