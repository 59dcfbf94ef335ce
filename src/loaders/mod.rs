//! Format-specific parsers behind one capability interface.
//!
//! Each [`ModelFormat`] variant is bound to exactly one [`FormatParser`].
//! Parsers are synchronous and never touch the network: the cascade fetches
//! whatever [`FormatParser::dependencies`] names before calling
//! [`FormatParser::parse`], and resolves external textures afterwards.

use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::error::ParseError;
use crate::format::ModelFormat;
use crate::scene::{SceneGraph, TextureImage};

pub mod fbx;
pub mod gltf;
pub mod obj;

pub use self::fbx::FbxParser;
pub use self::gltf::GltfParser;
pub use self::obj::ObjParser;

/// Everything a parser may look at for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct ParseInput<'a> {
    /// Location the body was fetched from.
    pub url: &'a str,
    pub bytes: &'a [u8],
    /// Base that relative references inside the file resolve against.
    pub resource_base: &'a str,
    /// Bodies of the references returned by [`FormatParser::dependencies`],
    /// keyed by the reference exactly as written in the file.
    pub resources: &'a HashMap<String, Vec<u8>>,
}

impl<'a> ParseInput<'a> {
    pub fn resource(&self, reference: &str) -> Option<&'a [u8]> {
        self.resources.get(reference).map(Vec::as_slice)
    }
}

pub trait FormatParser: Sync {
    fn format(&self) -> ModelFormat;

    /// External files the parse cannot proceed without (glTF buffers, OBJ
    /// material libraries). Unreadable input simply has no dependencies.
    fn dependencies(&self, _bytes: &[u8]) -> Vec<String> {
        Vec::new()
    }

    fn parse(&self, input: &ParseInput<'_>) -> Result<SceneGraph, ParseError>;
}

impl ModelFormat {
    /// The parser bound to this format.
    pub fn parser(self) -> &'static dyn FormatParser {
        match self {
            ModelFormat::Glb => &GltfParser::BINARY,
            ModelFormat::Gltf => &GltfParser::TEXT,
            ModelFormat::Fbx => &FbxParser,
            ModelFormat::Obj => &ObjParser,
        }
    }
}

/// Turns an anyhow chain into a [`ParseError`] carrying the byte preview.
pub(crate) fn parse_error(format: ModelFormat, err: anyhow::Error, bytes: &[u8]) -> ParseError {
    ParseError::new(format, format!("{err:#}"), bytes)
}

/// Decodes a PNG or JPEG texture into RGBA8 pixels.
pub fn decode_image(bytes: &[u8]) -> Result<TextureImage> {
    let image = image::load_from_memory(bytes).context("unsupported or corrupt image")?;
    let rgba = image.to_rgba8();
    Ok(TextureImage {
        width: rgba.width(),
        height: rgba.height(),
        rgba: rgba.into_raw(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_format_has_its_own_parser() {
        for format in ModelFormat::ALL {
            assert_eq!(format.parser().format(), format);
        }
    }

    #[test]
    fn garbage_images_are_rejected() {
        assert!(decode_image(b"not an image").is_err());
    }
}
