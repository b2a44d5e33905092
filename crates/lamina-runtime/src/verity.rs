//! dm-verity hash trees appended to squashfs images.
//!
//! The on-disk layout is what `veritysetup format --hash-offset` produces for
//! a combined data and hash device: the data area padded to 4 KiB, a 512-byte
//! verity superblock at the hash offset, then the hash levels starting at the
//! next hash block, top level first. Each hash is `sha256(salt || block)`.

use crate::RuntimeError;
use rand::RngCore;
use sha2::{Digest as _, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

const SIGNATURE: &[u8; 8] = b"verity\0\0";
const SUPERBLOCK_SIZE: u64 = 512;
const HASH_TYPE_NORMAL: u32 = 1;
const ALGORITHM: &str = "sha256";
const DIGEST_SIZE: usize = 32;
const MAX_SALT_SIZE: usize = 256;
pub const SALT_SIZE: usize = 32;
/// Alignment of the data area before the hash tree.
pub const DATA_ALIGNMENT: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityParams {
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub salt: Vec<u8>,
    pub uuid: [u8; 16],
}

impl VerityParams {
    /// Page-sized blocks with a random salt.
    pub fn for_host() -> Result<Self, RuntimeError> {
        let page = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .map_err(io::Error::from)?
            .and_then(|p| u32::try_from(p).ok())
            .unwrap_or(4096);
        Ok(Self::with_block_size(supported_block_size(page)?))
    }

    pub fn with_block_size(block_size: u32) -> Self {
        let mut rng = rand::thread_rng();
        let mut salt = vec![0u8; SALT_SIZE];
        rng.fill_bytes(&mut salt);
        let mut uuid = [0u8; 16];
        rng.fill_bytes(&mut uuid);
        // RFC 4122 version 4.
        uuid[6] = (uuid[6] & 0x0f) | 0x40;
        uuid[8] = (uuid[8] & 0x3f) | 0x80;
        Self {
            data_block_size: block_size,
            hash_block_size: block_size,
            salt,
            uuid,
        }
    }
}

/// Result of sealing an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VeritySeal {
    /// Hex root hash.
    pub root_hash: String,
    pub hash_offset: u64,
    pub data_blocks: u64,
}

struct Geometry {
    /// Hash levels, index 0 covers the data blocks.
    level_blocks: Vec<u64>,
    /// Absolute block number of each level in the hash area.
    level_start: Vec<u64>,
    end_block: u64,
}

impl Geometry {
    fn new(data_blocks: u64, hash_block_size: u32, hash_offset: u64) -> Self {
        let bits = (u64::from(hash_block_size) / DIGEST_SIZE as u64).ilog2();
        let mut levels = 0u32;
        if data_blocks > 0 {
            while bits * levels < 64 && (data_blocks - 1) >> (bits * levels) != 0 {
                levels += 1;
            }
        }
        let hash_block = u64::from(hash_block_size);
        let mut position = (hash_offset + SUPERBLOCK_SIZE).div_ceil(hash_block);
        let mut level_blocks = vec![0; levels as usize];
        let mut level_start = vec![0; levels as usize];
        for i in (0..levels as usize).rev() {
            let shift = (i as u32 + 1) * bits;
            let size = if shift >= 64 {
                1
            } else {
                data_blocks.div_ceil(1u64 << shift)
            };
            level_start[i] = position;
            level_blocks[i] = size;
            position += size;
        }
        Self {
            level_blocks,
            level_start,
            end_block: position,
        }
    }
}

fn hash_block(salt: &[u8], block: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut h = Sha256::new();
    h.update(salt);
    h.update(block);
    h.finalize().into()
}

/// Pack digests into zero-padded hash blocks.
fn pack(digests: &[[u8; DIGEST_SIZE]], block_size: usize) -> Vec<u8> {
    let per_block = block_size / DIGEST_SIZE;
    let blocks = digests.len().div_ceil(per_block);
    let mut out = vec![0u8; blocks * block_size];
    for (i, d) in digests.iter().enumerate() {
        let start = (i / per_block) * block_size + (i % per_block) * DIGEST_SIZE;
        out[start..start + DIGEST_SIZE].copy_from_slice(d);
    }
    out
}

/// Hash levels (index 0 first) and the root hash for the data in `reader`.
fn compute_tree(
    reader: impl Read,
    data_blocks: u64,
    params: &VerityParams,
    geometry: &Geometry,
) -> Result<(Vec<Vec<u8>>, [u8; DIGEST_SIZE]), RuntimeError> {
    let data_block_size = params.data_block_size as usize;
    let hash_block_size = params.hash_block_size as usize;
    let mut reader = BufReader::new(reader);
    let mut buf = vec![0u8; data_block_size];

    let mut first_block_hash = None;
    let mut digests = Vec::with_capacity(usize::try_from(data_blocks).unwrap_or(0));
    for _ in 0..data_blocks {
        reader.read_exact(&mut buf)?;
        let d = hash_block(&params.salt, &buf);
        first_block_hash.get_or_insert(d);
        digests.push(d);
    }

    let mut levels = Vec::with_capacity(geometry.level_blocks.len());
    for _ in 0..geometry.level_blocks.len() {
        let packed = pack(&digests, hash_block_size);
        digests = packed
            .chunks(hash_block_size)
            .map(|b| hash_block(&params.salt, b))
            .collect();
        levels.push(packed);
    }

    let root = if levels.is_empty() {
        match first_block_hash {
            Some(d) => d,
            None => hash_block(&params.salt, &vec![0u8; data_block_size]),
        }
    } else {
        // The top level is a single block; its hash is the root.
        digests.first().copied().unwrap_or_default()
    };
    Ok((levels, root))
}

fn superblock(params: &VerityParams, data_blocks: u64) -> Vec<u8> {
    let mut sb = Vec::with_capacity(SUPERBLOCK_SIZE as usize);
    sb.extend_from_slice(SIGNATURE);
    sb.extend_from_slice(&1u32.to_le_bytes());
    sb.extend_from_slice(&HASH_TYPE_NORMAL.to_le_bytes());
    sb.extend_from_slice(&params.uuid);
    let mut algorithm = [0u8; 32];
    algorithm[..ALGORITHM.len()].copy_from_slice(ALGORITHM.as_bytes());
    sb.extend_from_slice(&algorithm);
    sb.extend_from_slice(&params.data_block_size.to_le_bytes());
    sb.extend_from_slice(&params.hash_block_size.to_le_bytes());
    sb.extend_from_slice(&data_blocks.to_le_bytes());
    sb.extend_from_slice(&(params.salt.len() as u16).to_le_bytes());
    sb.extend_from_slice(&[0u8; 6]);
    let mut salt = [0u8; MAX_SALT_SIZE];
    salt[..params.salt.len()].copy_from_slice(&params.salt);
    sb.extend_from_slice(&salt);
    sb.resize(SUPERBLOCK_SIZE as usize, 0);
    sb
}

fn parse_superblock(sb: &[u8]) -> Result<(VerityParams, u64), RuntimeError> {
    let bad = |what: &str| RuntimeError::VerityMismatch(format!("invalid superblock: {what}"));
    if sb.len() < SUPERBLOCK_SIZE as usize || &sb[..8] != SIGNATURE {
        return Err(bad("signature"));
    }
    let u32_at = |off: usize| u32::from_le_bytes([sb[off], sb[off + 1], sb[off + 2], sb[off + 3]]);
    if u32_at(8) != 1 || u32_at(12) != HASH_TYPE_NORMAL {
        return Err(bad("version"));
    }
    let algorithm = &sb[32..64];
    let end = algorithm.iter().position(|&b| b == 0).unwrap_or(32);
    if &algorithm[..end] != ALGORITHM.as_bytes() {
        return Err(bad("algorithm"));
    }
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&sb[16..32]);
    let data_block_size = u32_at(64);
    let hash_block_size = u32_at(68);
    let mut blocks = [0u8; 8];
    blocks.copy_from_slice(&sb[72..80]);
    let data_blocks = u64::from_le_bytes(blocks);
    let salt_size = usize::from(u16::from_le_bytes([sb[80], sb[81]]));
    if salt_size > MAX_SALT_SIZE
        || !data_block_size.is_power_of_two()
        || !hash_block_size.is_power_of_two()
        || (hash_block_size as usize) < DIGEST_SIZE
    {
        return Err(bad("parameters"));
    }
    Ok((
        VerityParams {
            data_block_size,
            hash_block_size,
            salt: sb[88..88 + salt_size].to_vec(),
            uuid,
        },
        data_blocks,
    ))
}

/// Pad `path` to a 4 KiB multiple and append a verity superblock and hash
/// tree covering everything before it.
pub fn seal(path: &Path, params: &VerityParams) -> Result<VeritySeal, RuntimeError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let size = file.metadata()?.len();
    if size % 512 != 0 {
        return Err(RuntimeError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is {size} bytes, not a multiple of 512", path.display()),
        )));
    }
    let hash_offset = size.div_ceil(DATA_ALIGNMENT) * DATA_ALIGNMENT;
    file.set_len(hash_offset)?;

    let data_blocks = hash_offset / u64::from(params.data_block_size);
    let geometry = Geometry::new(data_blocks, params.hash_block_size, hash_offset);
    file.seek(SeekFrom::Start(0))?;
    let (levels, root) = compute_tree(&mut file, data_blocks, params, &geometry)?;

    file.seek(SeekFrom::Start(hash_offset))?;
    file.write_all(&superblock(params, data_blocks))?;
    let hash_block = u64::from(params.hash_block_size);
    for (i, level) in levels.iter().enumerate() {
        file.seek(SeekFrom::Start(geometry.level_start[i] * hash_block))?;
        file.write_all(level)?;
    }
    let end = (geometry.end_block * hash_block).max(hash_offset + SUPERBLOCK_SIZE);
    file.set_len(end)?;
    file.sync_all()?;

    let seal = VeritySeal {
        root_hash: hex::encode(root),
        hash_offset,
        data_blocks,
    };
    info!(
        "verity: {} data blocks, root {}",
        seal.data_blocks, seal.root_hash
    );
    Ok(seal)
}

/// Recompute the tree of a sealed image and compare it against the stored
/// tree and `root_hash`.
pub fn verify(path: &Path, root_hash: &str, hash_offset: u64) -> Result<(), RuntimeError> {
    let mut file = File::open(path)?;
    let mut sb = vec![0u8; SUPERBLOCK_SIZE as usize];
    file.seek(SeekFrom::Start(hash_offset))?;
    file.read_exact(&mut sb)?;
    let (params, data_blocks) = parse_superblock(&sb)?;
    if data_blocks * u64::from(params.data_block_size) > hash_offset {
        return Err(RuntimeError::VerityMismatch(
            "data area overlaps hash area".to_owned(),
        ));
    }

    let geometry = Geometry::new(data_blocks, params.hash_block_size, hash_offset);
    file.seek(SeekFrom::Start(0))?;
    let (levels, root) = compute_tree(&mut file, data_blocks, &params, &geometry)?;

    let hash_block = u64::from(params.hash_block_size);
    for (i, level) in levels.iter().enumerate() {
        let mut stored = vec![0u8; level.len()];
        file.seek(SeekFrom::Start(geometry.level_start[i] * hash_block))?;
        file.read_exact(&mut stored)?;
        if &stored != level {
            return Err(RuntimeError::VerityMismatch(format!(
                "hash level {i} of {} is corrupt",
                path.display()
            )));
        }
    }
    if !hex::encode(root).eq_ignore_ascii_case(root_hash) {
        return Err(RuntimeError::VerityMismatch(format!(
            "root hash of {} does not match",
            path.display()
        )));
    }
    debug!("verity ok: {}", path.display());
    Ok(())
}

/// Verify with `veritysetup verify`.
pub fn veritysetup_verify(path: &Path, root_hash: &str, hash_offset: u64) -> Result<(), RuntimeError> {
    let out = Command::new("veritysetup")
        .arg("verify")
        .arg(path)
        .arg(path)
        .arg(root_hash)
        .arg(format!("--hash-offset={hash_offset}"))
        .output()
        .map_err(|e| missing_or_io(e, "veritysetup"))?;
    if out.status.success() {
        return Ok(());
    }
    Err(RuntimeError::VerityMismatch(
        String::from_utf8_lossy(&out.stderr).trim().to_owned(),
    ))
}

/// dm-verity blocks are powers of two of at least 512 bytes, and the image is
/// only padded to `DATA_ALIGNMENT`, so larger blocks cannot be used.
fn supported_block_size(size: u32) -> Result<u32, RuntimeError> {
    if size.is_power_of_two()
        && (512..=65_536).contains(&size)
        && DATA_ALIGNMENT % u64::from(size) == 0
    {
        Ok(size)
    } else {
        Err(RuntimeError::VerityUnsupported(format!(
            "page size {size} is not a usable dm-verity block size"
        )))
    }
}

fn missing_or_io(e: io::Error, name: &str) -> RuntimeError {
    if e.kind() == io::ErrorKind::NotFound {
        RuntimeError::MissingHelper(name.to_owned())
    } else {
        RuntimeError::Io(e)
    }
}
