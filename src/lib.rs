//! # defectgen
//!
//! Fingerprint-keyed defect image lookup and synthesis.
//!
//! Two pieces share this crate:
//!
//! - the **mapping builder** (`defectgen map`) scans paired reference/defect
//!   directories and writes a JSON table from the MD5 fingerprint of each
//!   reference image to the path of its defect counterpart;
//! - the **service** (`defectgen serve`) loads that table and answers
//!   `POST /generate` uploads either from the table, from previously generated
//!   results, or by asking an image-to-image model for a new picture.
//!
//! ## Architecture
//!
//! ```text
//!  ref/ + def/ dirs ──▶ mapping::build_mapping ──▶ md5_map.json
//!                                                      │ (startup)
//!  upload ──▶ fingerprint ──▶ FingerprintMap hit? ──────┤──▶ mapped file
//!                               │ no
//!                               ▼
//!                        results/<fp>.png hit? ───────────▶ stored result
//!                               │ no
//!                               ▼
//!                 tmp/<name> ─▶ Synthesizer ─▶ results/<fp>.png
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`fingerprint`] | MD5 content fingerprints |
//! | [`mapping`] | Mapping builder and JSON table I/O |
//! | [`catalog`] | Defect code → prompt |
//! | [`config`] | TOML + environment configuration |
//! | [`synth`] | Generative collaborator trait and providers |
//! | [`store`] | Result cache, upload staging, per-fingerprint locks |
//! | [`server`] | HTTP server |
//! | [`logging`] | `tracing` subscriber setup |

pub mod catalog;
pub mod config;
pub mod fingerprint;
pub mod logging;
pub mod mapping;
pub mod server;
pub mod store;
pub mod synth;
