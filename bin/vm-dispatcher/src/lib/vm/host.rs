// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host hardware snapshot exchanged during precondition checks.

use dispatcher_api_types::{CheckError, ErrorCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::CpuConfig;

/// CPU flags, as named in /proc/cpuinfo, that a guest may be started with.
/// A flag's index is its bit in the feature mask.
const CPU_FEATURE_NAMES: &[&str] = &[
    "sse3", "ssse3", "sse4_1", "sse4_2", "popcnt", "aes", "xsave", "avx",
    "f16c", "rdrand", "fma", "avx2", "bmi1", "bmi2", "adx", "sha_ni",
    "avx512f", "avx512bw", "avx512vl", "vmx", "svm",
];

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct CpuInfo {
    pub count: u32,
    pub vendor: String,
    pub features: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct HostInfo {
    pub server_uuid: Uuid,
    pub host_name: String,
    pub cpu: CpuInfo,
}

impl HostInfo {
    /// Probes the local machine.
    pub fn detect(server_uuid: Uuid) -> HostInfo {
        let count = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let (vendor, features) = std::fs::read_to_string("/proc/cpuinfo")
            .map(|text| parse_cpuinfo(&text))
            .unwrap_or_default();
        HostInfo {
            server_uuid,
            host_name: local_host_name().unwrap_or_default(),
            cpu: CpuInfo { count, vendor, features },
        }
    }

    /// Compares a guest's CPU requirements against this host.
    ///
    /// A guest with more vCPUs than the host has cores still runs, so that
    /// is only a warning. Missing feature bits or a different vendor would
    /// crash a live guest and are reported as errors; the source may waive
    /// them when the guest is not running.
    pub fn check_cpu(
        &self,
        guest: &CpuConfig,
    ) -> (Vec<CheckError>, Vec<CheckError>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if guest.count > self.cpu.count {
            warnings.push(
                CheckError::new(ErrorCode::CpuCountExceedsHost)
                    .with_param(guest.count.to_string())
                    .with_param(self.cpu.count.to_string()),
            );
        }

        let missing = guest.features & !self.cpu.features;
        let vendor_mismatch = !guest.vendor.is_empty()
            && !self.cpu.vendor.is_empty()
            && guest.vendor != self.cpu.vendor;
        if missing != 0 || vendor_mismatch {
            let mut err = CheckError::new(ErrorCode::CpuIncompatible);
            for name in feature_names(missing) {
                err = err.with_param(name);
            }
            if vendor_mismatch {
                err = err.with_param(format!(
                    "vendor {} != {}",
                    guest.vendor, self.cpu.vendor
                ));
            }
            errors.push(err);
        }

        (errors, warnings)
    }

    /// Rewrites a guest's CPU section so it only advertises what this host
    /// provides.
    pub fn normalize_cpu(&self, guest: &mut CpuConfig) {
        guest.features &= self.cpu.features;
        if !self.cpu.vendor.is_empty() {
            guest.vendor = self.cpu.vendor.clone();
        }
    }
}

fn feature_names(mask: u64) -> impl Iterator<Item = &'static str> {
    CPU_FEATURE_NAMES
        .iter()
        .enumerate()
        .filter(move |(bit, _)| mask & (1 << bit) != 0)
        .map(|(_, name)| *name)
}

fn parse_cpuinfo(text: &str) -> (String, u64) {
    let mut vendor = String::new();
    let mut features = 0u64;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "vendor_id" if vendor.is_empty() => {
                vendor = value.trim().to_string();
            }
            "flags" if features == 0 => {
                for flag in value.split_whitespace() {
                    if let Some(bit) =
                        CPU_FEATURE_NAMES.iter().position(|n| *n == flag)
                    {
                        features |= 1 << bit;
                    }
                }
            }
            _ => {}
        }
    }
    (vendor, features)
}

fn local_host_name() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for its full length and gethostname
    // writes at most that many bytes.
    let rc = unsafe {
        libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len())
    };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(count: u32, features: u64) -> HostInfo {
        HostInfo {
            server_uuid: Uuid::new_v4(),
            host_name: "node".to_string(),
            cpu: CpuInfo {
                count,
                vendor: "GenuineIntel".to_string(),
                features,
            },
        }
    }

    #[test]
    fn cpuinfo_parsing_picks_known_flags() {
        let text = "processor\t: 0\n\
                    vendor_id\t: AuthenticAMD\n\
                    flags\t\t: fpu sse3 avx svm bogus\n\
                    processor\t: 1\n\
                    vendor_id\t: AuthenticAMD\n";
        let (vendor, features) = parse_cpuinfo(text);
        assert_eq!(vendor, "AuthenticAMD");
        let names: Vec<_> = feature_names(features).collect();
        assert_eq!(names, vec!["sse3", "avx", "svm"]);
    }

    #[test]
    fn cpu_count_is_a_warning() {
        let guest = CpuConfig { count: 16, features: 0, vendor: String::new() };
        let (errors, warnings) = host(4, 0).check_cpu(&guest);
        assert!(errors.is_empty());
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, ErrorCode::CpuCountExceedsHost);
        assert_eq!(warnings[0].params, vec!["16", "4"]);
    }

    #[test]
    fn missing_features_are_an_error() {
        let guest = CpuConfig {
            count: 2,
            features: 0b1011,
            vendor: "GenuineIntel".to_string(),
        };
        let (errors, warnings) = host(4, 0b0011).check_cpu(&guest);
        assert!(warnings.is_empty());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, ErrorCode::CpuIncompatible);
        assert_eq!(errors[0].params, vec!["sse4_2"]);

        let (errors, _) = host(4, 0b1111).check_cpu(&guest);
        assert!(errors.is_empty());
    }

    #[test]
    fn vendor_mismatch_is_an_error() {
        let guest = CpuConfig {
            count: 1,
            features: 0,
            vendor: "AuthenticAMD".to_string(),
        };
        let (errors, _) = host(4, 0).check_cpu(&guest);
        assert_eq!(errors[0].code, ErrorCode::CpuIncompatible);
    }

    #[test]
    fn normalize_masks_guest_features() {
        let mut guest = CpuConfig {
            count: 1,
            features: 0b1111,
            vendor: "Other".to_string(),
        };
        host(1, 0b0101).normalize_cpu(&mut guest);
        assert_eq!(guest.features, 0b0101);
        assert_eq!(guest.vendor, "GenuineIntel");
    }
}
