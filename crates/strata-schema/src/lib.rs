//! Pipeline parsing, layer validation, templating and provisioning fingerprints for Strata.
//!
//! This crate defines the schema layer: TOML pipeline parsing (`PipelineFile`),
//! the validated, ordinal-sorted layer graph (`Pipeline`), Tera rendering of
//! payloads (`render_str`, `render_value`), and the deterministic digest that
//! decides whether a layer must be re-provisioned (`compute_fingerprint`).

pub mod fingerprint;
pub mod normalize;
pub mod pipeline;
pub mod template;
pub mod types;

pub use fingerprint::{compute_fingerprint, Artifact};
pub use normalize::{
    validate_name, FilePayload, FirewallDecl, HostRef, InputRef, Layer, ManagedBlockDecl,
    OutputBinding, Pipeline, Protocol, Provision, ResourceDecl, ServiceDecl,
};
pub use pipeline::{
    parse_pipeline_file, parse_pipeline_str, FileSection, FirewallSection, InputSection,
    LayerSection, ManagedBlockSection, PipelineError, PipelineFile, ProviderSection,
    ProvisionSection, RemoteSection, ResourceSection, ServiceSection,
};
pub use template::{render_str, render_value, TemplateContext};
pub use types::{EnvName, Fingerprint, LayerName, ResourceHandle};
