//! `Archive::open`'s header decode against a real file on disk: magic/version
//! checks, geometry-vs-config cross-check, and the size check, exercised
//! through `tempfile` with a real `Header::encode()` payload rather than a
//! hand-rolled byte string.

use std::io::Write;

use fa_archiver::archive::{Archive, Config};
use fa_archiver::disk::{Geometry, Header};
use fa_archiver::error::Error;
use fa_archiver::mask::FilterMask;

fn tiny_config() -> Config {
    let mut mask = FilterMask::new(1);
    mask.set(0);
    Config::builder(1)
        .archive_mask(mask)
        .input_frame_count(1)
        .major_sample_count(1)
        .major_block_count(1)
        .build()
        .unwrap()
}

fn tiny_geometry() -> Geometry {
    let mut mask = FilterMask::new(1);
    mask.set(0);
    Geometry {
        n_devices: 1,
        archive_mask: mask,
        input_frame_count: 1,
        major_sample_count: 1,
        first_decimation_log2: 0,
        second_decimation_log2: 0,
        major_block_count: 1,
    }
}

fn data_start() -> u64 {
    u64::from(page_size::get() as u64)
}

/// A correctly encoded header for `tiny_geometry()`, padded out to
/// `data_start()` with zero bytes the way a freshly created archive file
/// would be (the header occupies a prefix of the first page).
fn encoded_header() -> Vec<u8> {
    let header = Header::new(tiny_geometry(), data_start());
    let mut bytes = header.encode();
    bytes.resize(data_start() as usize, 0);
    bytes
}

fn required_size() -> u64 {
    // data_start (one page) + major_block_size for the geometry above:
    // k=1, major_sample_count=1, D1=0 -> 1 * (1*8 + 1*32) = 40 bytes.
    data_start() + 40
}

#[test]
fn open_succeeds_against_a_correctly_sized_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&encoded_header()).unwrap();
    file.as_file().set_len(required_size()).unwrap();

    let config = tiny_config();
    let archive = Archive::open(file.path().to_str().unwrap(), &config).unwrap();
    assert_eq!(archive.geometry().n_devices, 1);
}

#[test]
fn open_rejects_a_file_too_small_for_the_header() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let header_bytes = encoded_header();
    file.write_all(&header_bytes[..header_bytes.len() - 1]).unwrap();

    let config = tiny_config();
    let err = Archive::open(file.path().to_str().unwrap(), &config).unwrap_err();
    assert!(matches!(err, Error::HeaderInvalid { .. }));
}

#[test]
fn open_rejects_a_file_too_small_for_the_data_region() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&encoded_header()).unwrap();
    file.as_file().set_len(required_size() - 1).unwrap();

    let config = tiny_config();
    let err = Archive::open(file.path().to_str().unwrap(), &config).unwrap_err();
    assert!(matches!(err, Error::HeaderInvalid { .. }));
}

#[test]
fn open_rejects_a_file_with_the_wrong_magic() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let mut header_bytes = encoded_header();
    header_bytes[..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    file.write_all(&header_bytes).unwrap();
    file.as_file().set_len(required_size()).unwrap();

    let config = tiny_config();
    let err = Archive::open(file.path().to_str().unwrap(), &config).unwrap_err();
    assert!(matches!(err, Error::HeaderInvalid { .. }));
}

#[test]
fn open_rejects_a_geometry_mismatch_against_the_config() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&encoded_header()).unwrap();
    file.as_file().set_len(required_size()).unwrap();

    let mismatched = Config::builder(1)
        .archive_mask({
            let mut mask = FilterMask::new(1);
            mask.set(0);
            mask
        })
        .input_frame_count(1)
        .major_sample_count(2)
        .major_block_count(1)
        .build()
        .unwrap();
    let err = Archive::open(file.path().to_str().unwrap(), &mismatched).unwrap_err();
    assert!(matches!(err, Error::HeaderInvalid { .. }));
}
