//! Pod template mutation.
//!
//! Rewrites the target container so that it is launched by the debug agent in
//! headless mode, with the original entrypoint passed through as the program
//! to debug. The debug agent binary, and optionally a replacement executable,
//! are mounted from the node via host-path volumes.
//!
//! Every step either overwrites a fixed value or updates an entry by name, so
//! applying the mutation to an already mutated template is a no-op.

use debug_profile::DebugProfile;
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, PodTemplateSpec, Volume, VolumeMount,
};

/// Volume holding the debug agent binary.
pub const DEBUG_AGENT_VOLUME: &str = "debug-agent";

/// Where the debug agent binary is mounted in the container.
pub const DEBUG_AGENT_MOUNT_PATH: &str = "/debug/dlv";

/// Volume holding the replacement executable.
pub const REPLACEMENT_VOLUME: &str = "debug-target";

/// Where the replacement executable is mounted in the container.
pub const REPLACEMENT_MOUNT_PATH: &str = "/debug/target";

/// Result of mutating a template in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The target container was rewritten (possibly to identical content)
    Applied,
    /// No container with the configured name exists; the template is untouched
    ContainerNotFound,
}

/// Returns a copy of `template` with the debug agent injected.
pub fn apply(template: &PodTemplateSpec, profile: &DebugProfile) -> PodTemplateSpec {
    let mut patched = template.clone();
    patch_pod_template(&mut patched, profile);
    patched
}

/// Position of the profile's target container in `template`.
pub fn target_index(template: &PodTemplateSpec, profile: &DebugProfile) -> Option<usize> {
    template
        .spec
        .as_ref()?
        .containers
        .iter()
        .position(|container| container.name == profile.container_name)
}

/// Injects the debug agent into `template` in place.
pub fn patch_pod_template(template: &mut PodTemplateSpec, profile: &DebugProfile) -> MutationOutcome {
    let Some(index) = target_index(template, profile) else {
        return MutationOutcome::ContainerNotFound;
    };
    let Some(spec) = template.spec.as_mut() else {
        return MutationOutcome::ContainerNotFound;
    };

    let mut container = spec.containers[index].clone();
    container.command = Some(debug_agent_command(profile.debug_port));
    container.args = Some(debug_agent_args(profile));

    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    ensure_host_path_volume(volumes, DEBUG_AGENT_VOLUME, &profile.debug_agent_host_path);
    ensure_volume_mount(&mut container, DEBUG_AGENT_VOLUME, DEBUG_AGENT_MOUNT_PATH);

    if let Some(replacement) = profile.replacement_executable() {
        ensure_host_path_volume(volumes, REPLACEMENT_VOLUME, replacement);
        ensure_volume_mount(&mut container, REPLACEMENT_VOLUME, REPLACEMENT_MOUNT_PATH);
    }

    spec.containers[index] = container;
    MutationOutcome::Applied
}

/// `dlv --listen=:<port> --headless=true --api-version=2 --log exec`
fn debug_agent_command(port: i32) -> Vec<String> {
    vec![
        DEBUG_AGENT_MOUNT_PATH.to_string(),
        format!("--listen=:{port}"),
        "--headless=true".to_string(),
        "--api-version=2".to_string(),
        "--log".to_string(),
        "exec".to_string(),
    ]
}

/// Program to debug, then `--` and its own arguments if it has any.
fn debug_agent_args(profile: &DebugProfile) -> Vec<String> {
    let executable = match profile.replacement_executable() {
        Some(_) => REPLACEMENT_MOUNT_PATH.to_string(),
        None => profile.command_args.first().cloned().unwrap_or_default(),
    };

    let mut args = vec![executable];
    if profile.command_args.len() > 1 {
        args.push("--".to_string());
        args.extend(profile.command_args[1..].iter().cloned());
    }
    args
}

fn ensure_host_path_volume(volumes: &mut Vec<Volume>, name: &str, host_path: &str) {
    let host_path = HostPathVolumeSource {
        path: host_path.to_string(),
        ..Default::default()
    };
    match volumes.iter_mut().find(|volume| volume.name == name) {
        Some(existing) => match existing.host_path.as_mut() {
            Some(source) => source.path = host_path.path,
            None => {
                // Same name but a different source: replace it wholesale.
                *existing = host_path_volume(name, host_path);
            }
        },
        None => volumes.push(host_path_volume(name, host_path)),
    }
}

fn host_path_volume(name: &str, source: HostPathVolumeSource) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(source),
        ..Default::default()
    }
}

fn ensure_volume_mount(container: &mut Container, volume: &str, mount_path: &str) {
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    match mounts.iter_mut().find(|mount| mount.name == volume) {
        Some(existing) => existing.mount_path = mount_path.to_string(),
        None => mounts.push(VolumeMount {
            name: volume.to_string(),
            mount_path: mount_path.to_string(),
            ..Default::default()
        }),
    }
}

#[cfg(test)]
#[path = "mutator_test.rs"]
mod mutator_test;
