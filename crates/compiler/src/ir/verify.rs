//! Pass 8: reference-integrity verification.
//!
//! The finished module must be closed: every entity an instruction names
//! either has a definition, is runtime-provided, or the referring method
//! carries a stub reason. Diagnostics accumulated by reachability and
//! lowering become `UnknownBodyReferences`; bodiless methods with no
//! runtime story become `MissingBody`.

use tracing::info;

use super::builder::IrBuilder;
use super::{MethodId, StubReason, TypeKind};

pub fn run(b: &mut IrBuilder<'_, '_>) {
    let mut stubbed = 0usize;
    for index in 0..b.module.methods.len() {
        let id = MethodId(index as u32);
        let key = b.module.method_key_string(id);

        // Unresolved references recorded against this method.
        if b.module.method(id).stub_reason.is_none() {
            if let Some(diags) = b.diagnostics.get(&key) {
                if !diags.is_empty() {
                    let detail = diags[0].clone();
                    b.stub(id, StubReason::UnknownBodyReferences(detail));
                }
            }
        }

        let needs_body = {
            let m = b.module.method(id);
            let declaring_kind = b.module.ty(m.declaring).kind.clone();
            m.stub_reason.is_none()
                && m.blocks.is_empty()
                && !m.is_declared_only()
                && !m.is_open_generic()
                && !m.flags.contains(super::MethodFlags::ABSTRACT)
                && !matches!(declaring_kind, TypeKind::Interface)
        };
        if needs_body {
            // Runtime-provided declaring types supply these bodies (array
            // accessors, Object plumbing); everything else is a missing
            // body.
            let runtime_backed = {
                let m = b.module.method(id);
                let ty = b.module.ty(m.declaring);
                ty.runtime_provided || matches!(ty.kind, TypeKind::Array { .. })
            };
            if runtime_backed {
                let m = b.module.method_mut(id);
                m.flags |= super::MethodFlags::RUNTIME;
            } else {
                b.stub(id, StubReason::MissingBody);
            }
        }

        if b.module.method(id).stub_reason.is_some() {
            stubbed += 1;
        }
    }
    info!(
        methods = b.module.methods.len(),
        stubbed, "reference integrity verified"
    );
}
