//! Parameterized text generation.
//!
//! Every artifact text (guest setup script, cloud-init configuration,
//! datasource policy, OVF descriptor, volume metadata) is a fixed
//! template with an enumerated set of `@FIELD@` substitution markers.
//! There is no dynamic field discovery; each render function spells out
//! exactly the fields its template consumes.

/// Version tag embedded in the OVF descriptor so support can tell which
/// builder produced an image.
pub const TOOL_VERSION: &str = concat!("ova-builder/", env!("CARGO_PKG_VERSION"));

/// Guest customization script run inside the chroot.
///
/// Fields: `@DISTRO@`, `@RHN_USER@`, `@RHN_PASSWORD@`, `@ROOT_PASSWORD@`.
const SETUP_SCRIPT: &str = r#"#!/bin/sh
# Generated guest customization for @DISTRO@ images. Runs once inside
# the chroot; a non-zero exit aborts the conversion.
set -e

if [ -n "@RHN_USER@" ]; then
    subscription-manager register \
        --username '@RHN_USER@' --password '@RHN_PASSWORD@' --auto-attach
fi

if [ -n "@ROOT_PASSWORD@" ]; then
    echo 'root:@ROOT_PASSWORD@' | chpasswd
fi

# Strip the SSH host identity so every deployed instance regenerates
# its own keys.
rm -f /etc/ssh/ssh_host_*

# Rebuild the boot configuration against the grown root filesystem.
if command -v grub2-mkconfig >/dev/null 2>&1; then
    grub2-mkconfig -o /boot/grub2/grub.cfg
fi

exit 0
"#;

/// cloud-init main configuration staged into the guest.
const CLOUD_CONFIG: &str = r#"# Installed by the image preparation pipeline.
users:
  - default
disable_root: false
ssh_pwauth: true
preserve_hostname: false
cloud_init_modules:
  - migrator
  - bootcmd
  - write-files
  - growpart
  - resize_devices
  - set_hostname
  - update_hostname
cloud_config_modules:
  - mounts
  - ssh-import-id
  - set-passwords
  - package-update-upgrade-install
  - timezone
  - runcmd
cloud_final_modules:
  - scripts-per-once
  - scripts-per-boot
  - scripts-per-instance
  - scripts-user
  - ssh-authkey-fingerprints
  - final-message
"#;

/// Datasource identification policy: images boot with a config drive
/// attached, so ds-identify must not fall back to disabling cloud-init.
const DS_IDENTIFY_POLICY: &str = r#"# Installed by the image preparation pipeline.
datasource: ConfigDrive
policy: search,found=all,maybe=all,notfound=disabled
"#;

/// OVF descriptor for the packaged disk.
///
/// Fields: `@IMAGE_NAME@`, `@VOLUME_NAME@`, `@FILE_SIZE@`,
/// `@CAPACITY@`, `@OS_ID@`, `@TOOL_VERSION@`.
const OVF_DESCRIPTOR: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ovf:Envelope xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1"
              xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData"
              xmlns:vssd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_VirtualSystemSettingData">
  <ovf:References>
    <ovf:File ovf:href="@IMAGE_NAME@.raw" ovf:id="file1" ovf:size="@FILE_SIZE@"/>
  </ovf:References>
  <ovf:DiskSection>
    <ovf:Info>Disk Section</ovf:Info>
    <ovf:Disk ovf:capacity="@CAPACITY@" ovf:capacityAllocationUnits="byte"
              ovf:diskId="disk1" ovf:fileRef="file1"/>
  </ovf:DiskSection>
  <ovf:VirtualSystemCollection ovf:id="@IMAGE_NAME@">
    <ovf:VirtualSystem ovf:id="@IMAGE_NAME@">
      <ovf:Name>@IMAGE_NAME@</ovf:Name>
      <ovf:OperatingSystemSection ovf:id="@OS_ID@">
        <ovf:Info>Guest operating system</ovf:Info>
      </ovf:OperatingSystemSection>
      <ovf:VirtualHardwareSection>
        <ovf:Info>Storage resources</ovf:Info>
        <ovf:Item>
          <rasd:AddressOnParent>0</rasd:AddressOnParent>
          <rasd:ElementName>@VOLUME_NAME@</rasd:ElementName>
          <rasd:HostResource>ovf:/disk/disk1</rasd:HostResource>
          <rasd:InstanceID>1</rasd:InstanceID>
          <rasd:ResourceType>17</rasd:ResourceType>
        </ovf:Item>
      </ovf:VirtualHardwareSection>
    </ovf:VirtualSystem>
  </ovf:VirtualSystemCollection>
  <ovf:Annotation>Produced by @TOOL_VERSION@</ovf:Annotation>
</ovf:Envelope>
"#;

/// Volume metadata bundled next to the descriptor.
///
/// Fields: `@IMAGE_NAME@`.
const VOLUME_META: &str = "image=@IMAGE_NAME@\nvolume=@IMAGE_NAME@\nbootable=true\n";

/// Render the guest setup script. Empty credential fields render as
/// empty strings and the script's guards skip the matching step.
pub fn render_setup_script(
    distro: &str,
    rhn_user: Option<&str>,
    rhn_password: Option<&str>,
    root_password: Option<&str>,
) -> String {
    SETUP_SCRIPT
        .replace("@DISTRO@", distro)
        .replace("@RHN_USER@", rhn_user.unwrap_or(""))
        .replace("@RHN_PASSWORD@", rhn_password.unwrap_or(""))
        .replace("@ROOT_PASSWORD@", root_password.unwrap_or(""))
}

pub fn cloud_config() -> &'static str {
    CLOUD_CONFIG
}

pub fn ds_identify_policy() -> &'static str {
    DS_IDENTIFY_POLICY
}

/// Render the OVF descriptor from the finished disk's real size and the
/// target capacity in bytes.
pub fn render_ovf(
    image_name: &str,
    volume_name: &str,
    file_size_bytes: u64,
    capacity_bytes: u64,
    guest_os_id: u32,
) -> String {
    OVF_DESCRIPTOR
        .replace("@IMAGE_NAME@", image_name)
        .replace("@VOLUME_NAME@", volume_name)
        .replace("@FILE_SIZE@", &file_size_bytes.to_string())
        .replace("@CAPACITY@", &capacity_bytes.to_string())
        .replace("@OS_ID@", &guest_os_id.to_string())
        .replace("@TOOL_VERSION@", TOOL_VERSION)
}

pub fn render_meta(image_name: &str) -> String {
    VOLUME_META.replace("@IMAGE_NAME@", image_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_script_substitutes_all_fields() {
        let script = render_setup_script("rhel", Some("user"), Some("secret"), Some("pw"));
        assert!(script.contains("for rhel images"));
        assert!(script.contains("--username 'user' --password 'secret'"));
        assert!(script.contains("echo 'root:pw'"));
        assert!(!script.contains('@'));
        // machine-id is reset from outside the chroot; inside, the path
        // is shadowed by the host bind mount.
        assert!(!script.contains("machine-id"));
    }

    #[test]
    fn setup_script_renders_empty_credentials() {
        let script = render_setup_script("centos", None, None, None);
        assert!(script.contains(r#"if [ -n "" ]"#));
        assert!(!script.contains('@'));
    }

    #[test]
    fn ovf_substitutes_sizes_and_names() {
        let text = render_ovf("rhel-9", "rhel-9-vol", 1234, 20 << 30, 80);
        assert!(text.contains(r#"ovf:size="1234""#));
        assert!(text.contains(&format!(r#"ovf:capacity="{}""#, 20u64 << 30)));
        assert!(text.contains(r#"ovf:href="rhel-9.raw""#));
        assert!(text.contains("<rasd:ElementName>rhel-9-vol</rasd:ElementName>"));
        assert!(text.contains(r#"OperatingSystemSection ovf:id="80""#));
        assert!(!text.contains('@'));
    }

    #[test]
    fn meta_names_the_image() {
        assert_eq!(
            render_meta("rhel-9"),
            "image=rhel-9\nvolume=rhel-9\nbootable=true\n"
        );
    }
}
