//! Command lines of the hypervisor and its companions
//!
//! Everything here is a pure function of the runner document, so the same
//! document always yields the same argument vector.

use std::path::{Path, PathBuf};

use crds::runner_config::{AGENT_PORT_NAME, DriveType, RunnerConfig, RunnerNetwork};
use crds::{Firmware, RtcBase};

use crate::config::RunnerSettings;

const MIB: u64 = 1 << 20;

/// Sockets and generated files of one VM instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub monitor_socket: PathBuf,
    pub agent_socket: PathBuf,
    pub tpm_socket: PathBuf,
    pub tpm_state_dir: PathBuf,
    pub cloud_init_dir: PathBuf,
    pub cloud_init_image: PathBuf,
    pub firmware_vars: PathBuf,
}

impl RuntimePaths {
    pub fn new(config: &RunnerConfig) -> Self {
        let runtime = Path::new(&config.runtime_dir);
        let data = Path::new(&config.data_dir);
        Self {
            monitor_socket: runtime.join("monitor.sock"),
            agent_socket: runtime.join("agent.sock"),
            tpm_socket: runtime.join("swtpm-sock"),
            tpm_state_dir: data.join("tpm"),
            cloud_init_dir: runtime.join("cloud-init"),
            cloud_init_image: runtime.join("cloud-init.iso"),
            firmware_vars: data.join("fw-vars.fd"),
        }
    }
}

struct Args(Vec<String>);

impl Args {
    fn opt(&mut self, flag: &str, value: impl Into<String>) -> &mut Self {
        self.0.push(flag.to_string());
        self.0.push(value.into());
        self
    }

    fn flag(&mut self, flag: &str) -> &mut Self {
        self.0.push(flag.to_string());
        self
    }
}

/// QEMU device id of the vCPU hot-plugged into slot `index`
pub fn cpu_device_id(index: usize) -> String {
    format!("cpu-{}", index)
}

pub fn qemu_args(config: &RunnerConfig, settings: &RunnerSettings, paths: &RuntimePaths) -> Vec<String> {
    let vm = &config.vm;
    let mut args = Args(Vec::new());

    let machine = match vm.firmware {
        Firmware::Secure => "q35,accel=kvm,smm=on",
        Firmware::Uefi | Firmware::Bios => "q35,accel=kvm",
    };
    args.opt("-name", vm.name.as_str())
        .opt("-uuid", vm.uuid.as_str())
        .opt("-machine", machine)
        .flag("-nodefaults")
        .flag("-no-user-config")
        .opt("-cpu", vm.cpu_model.as_str())
        .opt(
            "-smp",
            format!("cpus={},maxcpus={},sockets=1,cores={},threads=1", vm.current_cpus, vm.maximum_cpus, vm.maximum_cpus),
        )
        .opt("-m", format!("{}M", vm.maximum_ram.div_ceil(MIB)))
        .opt("-device", "virtio-balloon-pci,id=balloon0")
        .opt(
            "-rtc",
            match vm.rtc_base {
                RtcBase::Utc => "base=utc",
                RtcBase::Localtime => "base=localtime",
            },
        )
        .opt(
            "-chardev",
            format!("socket,id=monitor,path={},server=on,wait=off", paths.monitor_socket.display()),
        )
        .opt("-mon", "chardev=monitor,mode=control");

    if matches!(vm.firmware, Firmware::Uefi | Firmware::Secure) {
        if vm.firmware == Firmware::Secure {
            args.opt("-global", "driver=cfi.pflash01,property=secure,value=on");
        }
        args.opt(
            "-drive",
            format!("if=pflash,format=raw,unit=0,readonly=on,file={}", settings.ovmf_code.display()),
        )
        .opt(
            "-drive",
            format!("if=pflash,format=raw,unit=1,file={}", paths.firmware_vars.display()),
        );
    }

    if vm.use_tpm {
        args.opt("-chardev", format!("socket,id=chrtpm,path={}", paths.tpm_socket.display()))
            .opt("-tpmdev", "emulator,id=tpm0,chardev=chrtpm")
            .opt("-device", "tpm-crb,tpmdev=tpm0");
    }

    for (index, network) in vm.network.iter().enumerate() {
        let (netdev, mac) = match network {
            RunnerNetwork::Tap { bridge, mac } => (format!("bridge,id=net{},br={}", index, bridge), mac),
            RunnerNetwork::User { mac } => (format!("user,id=net{}", index), mac),
        };
        let mut device = format!("virtio-net-pci,netdev=net{}", index);
        if let Some(mac) = mac {
            device.push_str(&format!(",mac={}", mac));
        }
        args.opt("-netdev", netdev).opt("-device", device);
    }

    let mut ide_bus = 0;
    for drive in &vm.drives {
        let id = format!("drive-{}", drive.name);
        let bootindex = drive
            .bootindex
            .map(|b| format!(",bootindex={}", b))
            .unwrap_or_default();
        match drive.type_ {
            DriveType::Disk => {
                let Some(path) = drive.device.as_ref().or(drive.file.as_ref()) else {
                    continue;
                };
                args.opt("-drive", format!("id={},if=none,format=raw,cache=none,aio=native,file={}", id, path))
                    .opt("-device", format!("virtio-blk-pci,drive={}{}", id, bootindex));
            }
            DriveType::Cdrom => {
                let media = drive
                    .file
                    .as_ref()
                    .map(|f| format!(",file={}", f))
                    .unwrap_or_default();
                args.opt("-drive", format!("id={},if=none,media=cdrom,readonly=on{}", id, media))
                    .opt("-device", format!("ide-cd,bus=ide.{},drive={}{}", ide_bus, id, bootindex));
                ide_bus += 1;
            }
        }
    }

    if config.cloud_init.is_some() {
        args.opt(
            "-drive",
            format!("id=cidata,if=none,media=cdrom,readonly=on,file={}", paths.cloud_init_image.display()),
        )
        .opt("-device", format!("ide-cd,bus=ide.{},drive=cidata", ide_bus));
    }

    args.opt("-device", "virtio-serial-pci,id=virtio-serial0")
        .opt(
            "-chardev",
            format!("socket,id=agent,path={},server=on,wait=off", paths.agent_socket.display()),
        )
        .opt("-device", format!("virtserialport,chardev=agent,name={}", AGENT_PORT_NAME));

    match &vm.display.spice {
        Some(spice) => {
            let mut spice_opt = format!("port={},addr=0.0.0.0", spice.port);
            if spice.ticketless {
                spice_opt.push_str(",disable-ticketing=on");
            }
            args.opt("-spice", spice_opt)
                .opt("-device", "qxl-vga")
                .opt("-device", "virtio-serial-pci,id=spice-serial")
                .opt("-chardev", "spicevmc,id=vdagent,name=vdagent")
                .opt("-device", "virtserialport,bus=spice-serial.0,chardev=vdagent,name=com.redhat.spice.0");
        }
        None => {
            args.opt("-display", "none");
        }
    }

    args.0
}

pub fn swtpm_args(paths: &RuntimePaths) -> Vec<String> {
    vec![
        "socket".to_string(),
        "--tpm2".to_string(),
        "--tpmstate".to_string(),
        format!("dir={}", paths.tpm_state_dir.display()),
        "--ctrl".to_string(),
        format!("type=unixio,path={}", paths.tpm_socket.display()),
    ]
}

pub fn iso_builder_args(paths: &RuntimePaths) -> Vec<String> {
    vec![
        "-output".to_string(),
        paths.cloud_init_image.display().to_string(),
        "-volid".to_string(),
        "cidata".to_string(),
        "-joliet".to_string(),
        "-rock".to_string(),
        paths.cloud_init_dir.display().to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use crds::CloudInit;

    fn value_of<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn test_cpu_and_memory() {
        let config = test_runner_config();
        let args = qemu_args(&config, &RunnerSettings::default(), &RuntimePaths::new(&config));
        assert_eq!(value_of(&args, "-smp"), ["cpus=2,maxcpus=4,sockets=1,cores=4,threads=1"]);
        assert_eq!(value_of(&args, "-m"), ["4096M"]);
        assert_eq!(value_of(&args, "-machine"), ["q35,accel=kvm"]);
        assert_eq!(value_of(&args, "-uuid"), ["6f3c3c5e-9d2b-4c1d-8a51-0f0e7d5c2b11"]);
    }

    #[test]
    fn test_devices() {
        let config = test_runner_config();
        let args = qemu_args(&config, &RunnerSettings::default(), &RuntimePaths::new(&config));
        let drives = value_of(&args, "-drive");
        assert!(drives.contains(&"id=drive-system,if=none,format=raw,cache=none,aio=native,file=/dev/system"));
        assert!(drives.contains(&"id=drive-cdrom0,if=none,media=cdrom,readonly=on,file=/images/install.iso"));
        assert!(drives.iter().any(|d| d.starts_with("if=pflash") && d.ends_with("/var/local/vm-data/fw-vars.fd")));

        let devices = value_of(&args, "-device");
        assert!(devices.contains(&"virtio-blk-pci,drive=drive-system,bootindex=0"));
        assert!(devices.contains(&"ide-cd,bus=ide.0,drive=drive-cdrom0,bootindex=1"));
        assert!(devices.contains(&"virtio-net-pci,netdev=net0,mac=52:54:00:12:34:56"));
        assert_eq!(value_of(&args, "-netdev"), ["bridge,id=net0,br=br0"]);
        assert_eq!(value_of(&args, "-spice"), ["port=5910,addr=0.0.0.0"]);
        assert!(
            value_of(&args, "-chardev")
                .contains(&"socket,id=monitor,path=/run/vmrunner/monitor.sock,server=on,wait=off")
        );
    }

    #[test]
    fn test_optional_features() {
        let mut config = test_runner_config();
        config.vm.firmware = Firmware::Bios;
        config.vm.use_tpm = true;
        config.vm.display.spice = None;
        config.cloud_init = Some(CloudInit {
            user_data: Some("#cloud-config\n".to_string()),
            ..Default::default()
        });
        let args = qemu_args(&config, &RunnerSettings::default(), &RuntimePaths::new(&config));

        assert!(!value_of(&args, "-drive").iter().any(|d| d.starts_with("if=pflash")));
        assert_eq!(value_of(&args, "-tpmdev"), ["emulator,id=tpm0,chardev=chrtpm"]);
        assert_eq!(value_of(&args, "-display"), ["none"]);
        assert!(value_of(&args, "-device").contains(&"ide-cd,bus=ide.1,drive=cidata"));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let config = test_runner_config();
        let paths = RuntimePaths::new(&config);
        let settings = RunnerSettings::default();
        assert_eq!(qemu_args(&config, &settings, &paths), qemu_args(&config, &settings, &paths));
    }
}
