//! Merges vendor component downloads into aggregate KiCad libraries.
//!
//! Zip archives from Octopart, Samacsys, UltraLibrarian, Snapeda and
//! similar services each carry a symbol, a footprint and often a 3D
//! model for a single part. [`importer::Importer`] unpacks an archive,
//! cross-links those assets and splices them into one library per
//! vendor, so a project sees `Snapeda.kicad_sym` and `Snapeda.pretty`
//! instead of hundreds of single-part libraries.

pub mod archive;
pub mod cli;
pub mod config;
pub mod easyeda;
pub mod error;
pub mod footprint;
pub mod importer;
pub mod merge;
pub mod settings;
pub mod sexp;
pub mod symbol;
pub mod upgrade;
pub mod watch;
