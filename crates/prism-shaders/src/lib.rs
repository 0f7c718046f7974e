//! Shaders for the Prism demos.
//!
//! GLSL sources live in `shaders/` and are compiled to SPIR-V at build time
//! using shaderc. The compiled modules are embedded ([`compiled_spirv`]) and
//! also loaded at runtime through [`ShaderLibrary`], which can be pointed at
//! another directory with `$PRISM_SHADER_DIR`.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Environment variable overriding the default SPIR-V directory.
pub const SHADER_DIR_ENV: &str = "PRISM_SHADER_DIR";

/// File names of the compiled shaders.
pub mod names {
    /// Image copy compute shader.
    pub const IMAGE_COMP: &str = "image.comp.spv";
    /// Particle integration compute shader.
    pub const PARTICLES_COMP: &str = "particles.comp.spv";
    /// Shadow map vertex shader.
    pub const SHADOW_VERT: &str = "shadow.vert.spv";
    /// Shadow map tessellation control shader.
    pub const SHADOW_TESC: &str = "shadow.tesc.spv";
    /// Shadow map tessellation evaluation shader.
    pub const SHADOW_TESE: &str = "shadow.tese.spv";
    /// Shadow map fragment shader.
    pub const SHADOW_FRAG: &str = "shadow.frag.spv";
}

/// Shader loading errors.
#[derive(Error, Debug)]
pub enum ShaderError {
    /// The shader file could not be read.
    #[error("Failed to read shader {path}: {source}")]
    Io {
        /// Path that was read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Byte length is not a multiple of four.
    #[error("Shader {name} is {len} bytes, not a multiple of 4")]
    Misaligned {
        /// Shader name
        name: String,
        /// Byte length
        len: usize,
    },

    /// The first word is not the SPIR-V magic number.
    #[error("Shader {name} has magic {found:#010x}, expected {SPIRV_MAGIC:#010x}")]
    BadMagic {
        /// Shader name
        name: String,
        /// First word of the file, 0 if empty
        found: u32,
    },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, ShaderError>;

/// Convert raw little-endian SPIR-V bytes into words.
///
/// `name` is only used in error messages.
pub fn spirv_from_bytes(name: &str, bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(ShaderError::Misaligned {
            name: name.to_string(),
            len: bytes.len(),
        });
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        found => Err(ShaderError::BadMagic {
            name: name.to_string(),
            found: found.copied().unwrap_or(0),
        }),
    }
}

/// Directory the build script writes the compiled shaders to.
pub const COMPILED_DIR: &str = env!("OUT_DIR");

/// Embedded SPIR-V bytecode (raw bytes, may not be aligned).
mod spirv_bytes {
    pub static IMAGE_COMP: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/image.comp.spv"));
    pub static PARTICLES_COMP: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/particles.comp.spv"));
    pub static SHADOW_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/shadow.vert.spv"));
    pub static SHADOW_TESC: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/shadow.tesc.spv"));
    pub static SHADOW_TESE: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/shadow.tese.spv"));
    pub static SHADOW_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/shadow.frag.spv"));
}

/// SPIR-V compiled into this crate for the shader `name`.
pub fn compiled_spirv(name: &str) -> Option<Result<Vec<u32>>> {
    let bytes = match name {
        names::IMAGE_COMP => spirv_bytes::IMAGE_COMP,
        names::PARTICLES_COMP => spirv_bytes::PARTICLES_COMP,
        names::SHADOW_VERT => spirv_bytes::SHADOW_VERT,
        names::SHADOW_TESC => spirv_bytes::SHADOW_TESC,
        names::SHADOW_TESE => spirv_bytes::SHADOW_TESE,
        names::SHADOW_FRAG => spirv_bytes::SHADOW_FRAG,
        _ => return None,
    };
    Some(spirv_from_bytes(name, bytes))
}

/// A directory of compiled SPIR-V files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderLibrary {
    root: PathBuf,
}

impl Default for ShaderLibrary {
    /// Uses `$PRISM_SHADER_DIR` if set, otherwise the build output.
    fn default() -> Self {
        std::env::var_os(SHADER_DIR_ENV).map_or_else(Self::compiled, Self::new)
    }
}

impl ShaderLibrary {
    /// Create a library rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Library over the shaders compiled by this crate's build script.
    pub fn compiled() -> Self {
        Self::new(COMPILED_DIR)
    }

    /// Directory the shaders are read from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the shader `name`.
    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Read `<root>/<name>` and convert it to SPIR-V words.
    pub fn load(&self, name: &str) -> Result<Vec<u32>> {
        let path = self.path(name);
        let bytes = std::fs::read(&path).map_err(|source| ShaderError::Io {
            path: path.clone(),
            source,
        })?;
        let words = spirv_from_bytes(name, &bytes)?;
        tracing::debug!("Loaded shader {} ({} words)", path.display(), words.len());
        Ok(words)
    }
}

/// GLSL source of a shader, keyed by its compiled name.
pub fn glsl_source(name: &str) -> Option<&'static str> {
    match name {
        names::IMAGE_COMP => Some(include_str!("../shaders/image.comp")),
        names::PARTICLES_COMP => Some(include_str!("../shaders/particles.comp")),
        names::SHADOW_VERT => Some(include_str!("../shaders/shadow.vert")),
        names::SHADOW_TESC => Some(include_str!("../shaders/shadow.tesc")),
        names::SHADOW_TESE => Some(include_str!("../shaders/shadow.tese")),
        names::SHADOW_FRAG => Some(include_str!("../shaders/shadow.frag")),
        _ => None,
    }
}
