//! Print the VM operator CRDs as a multi-document YAML stream

use anyhow::{Context, Result};
use crds::{VirtualMachine, VmPool};
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let vm = serde_yaml::to_string(&VirtualMachine::crd()).context("rendering VirtualMachine CRD")?;
    let pool = serde_yaml::to_string(&VmPool::crd()).context("rendering VmPool CRD")?;
    print!("---\n{}---\n{}", vm, pool);
    Ok(())
}
