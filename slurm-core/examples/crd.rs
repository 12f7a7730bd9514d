//! A script used to generate the CRDs used by this project.
//!
//! Any time a CRD spec changes, this script can be run to ensure that the CRDs are up-to-date and
//! ready to be synced with the cluster: `cargo run -p slurm-core --example crd > crds.yaml`.

use anyhow::{Context, Result};
use kube::CustomResourceExt;
use slurm_core::crd::{Controller, NodeSet, RestApi};

fn main() -> Result<()> {
    let crds = [
        ("NodeSet", NodeSet::crd()),
        ("Controller", Controller::crd()),
        ("RestApi", RestApi::crd()),
    ];
    for (kind, crd) in crds {
        let yaml = serde_yaml::to_string(&crd).with_context(|| format!("error serializing {} CRD to yaml", kind))?;
        println!("---\n{}", yaml);
        eprintln!("{} CRD written to stdout", kind);
    }
    Ok(())
}
