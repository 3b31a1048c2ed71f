/*!
 * Module Image
 * `MZJS` | u32 LE header length | JSON descriptor | body
 */

use super::types::{LoaderError, LoaderResult, ModuleDescriptor};
use crate::core::limits::MODULE_MAGIC;
use bytes::{BufMut, Bytes, BytesMut};

const PREFIX_LEN: usize = MODULE_MAGIC.len() + 4;

/// Serialize a descriptor and body into an image
pub fn encode_image(descriptor: &ModuleDescriptor, body: &[u8]) -> LoaderResult<Bytes> {
    let header = serde_json::to_vec(descriptor).map_err(|e| LoaderError::InvalidHeader(e.to_string()))?;
    let mut out = BytesMut::with_capacity(PREFIX_LEN + header.len() + body.len());
    out.put_slice(&MODULE_MAGIC);
    out.put_u32_le(header.len() as u32);
    out.put_slice(&header);
    out.put_slice(body);
    Ok(out.freeze())
}

/// Split an image into its descriptor and body (the body shares `image`)
pub fn parse_image(image: &Bytes) -> LoaderResult<(ModuleDescriptor, Bytes)> {
    if image.len() < PREFIX_LEN {
        return Err(LoaderError::Truncated(format!("{} bytes", image.len())));
    }
    if image[..MODULE_MAGIC.len()] != MODULE_MAGIC {
        return Err(LoaderError::BadMagic);
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&image[MODULE_MAGIC.len()..PREFIX_LEN]);
    let header_len = u32::from_le_bytes(len_bytes) as usize;

    let header_end = PREFIX_LEN
        .checked_add(header_len)
        .filter(|end| *end <= image.len())
        .ok_or_else(|| LoaderError::Truncated(format!("header of {} bytes", header_len)))?;

    let descriptor: ModuleDescriptor = serde_json::from_slice(&image[PREFIX_LEN..header_end])
        .map_err(|e| LoaderError::InvalidHeader(e.to_string()))?;
    Ok((descriptor, image.slice(header_end..)))
}
