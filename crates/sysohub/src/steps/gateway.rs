//! The gateway's step registry.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde_json::Value;

use super::{
    Hostname, ManagedFile, ManagedStep, MosquittoPassword, NpmGlobal, OwnedDir, Packages,
    ReleaseBinary, Service, Sysctl, SystemUser,
};
use crate::config::Deployment;
use crate::step::StepRegistry;
use crate::system::{FilePerms, System};
use crate::templates::{self, TemplateSet};

/// Every systemd unit the gateway manages, in start order.
pub const MANAGED_UNITS: &[&str] = &[
    "hostapd",
    "dnsmasq",
    "avahi-daemon",
    "mosquitto",
    "victoria-metrics",
    "nodered",
    "sysohub-dashboard",
];

/// npm package and program name of the flow editor.
pub(crate) const NODE_RED_PACKAGE: &str = "node-red";
pub(crate) const NODE_RED_PROGRAM: &str = "node-red";

const DHCPCD_CONF: &str = "/etc/dhcpcd.conf";
const HOSTAPD_CONF: &str = "/etc/hostapd/hostapd.conf";
const HOSTAPD_DEFAULT: &str = "/etc/default/hostapd";
const DNSMASQ_CONF: &str = "/etc/dnsmasq.conf";
const MOSQUITTO_CONF: &str = "/etc/mosquitto/mosquitto.conf";
const MOSQUITTO_PASSWD: &str = "/etc/mosquitto/passwd";
const VM_USER: &str = "victoria-metrics";

const AP_PACKAGES: &[&str] = &["hostapd", "dnsmasq", "avahi-daemon"];
const BROKER_PACKAGES: &[&str] = &["mosquitto", "mosquitto-clients"];
const FLOWS_PACKAGES: &[&str] = &["nodejs", "npm"];
const DASHBOARD_PACKAGES: &[&str] = &[
    "python3-flask",
    "python3-socketio",
    "python3-paho-mqtt",
    "python3-requests",
    "python3-eventlet",
    "python3-psutil",
];

fn unit_path(unit: &str) -> PathBuf {
    Path::new("/etc/systemd/system").join(format!("{unit}.service"))
}

/// A file rendered from a template against the shared context.
fn rendered(
    templates: &Rc<TemplateSet>,
    context: &Rc<Value>,
    template: &'static str,
    path: impl Into<PathBuf>,
    perms: FilePerms,
) -> ManagedFile {
    let templates = Rc::clone(templates);
    let context = Rc::clone(context);
    ManagedFile::new(path, perms, move |_| {
        Ok(templates.render(template, context.as_ref())?.into_bytes())
    })
}

/// The Node-RED unit needs the real node and node-red paths, which only
/// exist once the runtime is installed.
fn node_red_unit(templates: &Rc<TemplateSet>, context: &Rc<Value>) -> ManagedFile {
    let templates = Rc::clone(templates);
    let context = Rc::clone(context);
    ManagedFile::new(
        unit_path("nodered"),
        FilePerms::root(0o644),
        move |sys: &dyn System| {
            let mut ctx = context.as_ref().clone();
            if let Some(node_red) = ctx.get_mut("node_red").and_then(Value::as_object_mut) {
                if let Some(node) = sys.find_program("node") {
                    node_red.insert("node".into(), Value::from(node.to_string_lossy().into_owned()));
                }
                if let Some(bin) = sys.find_program("node-red") {
                    node_red.insert("binary".into(), Value::from(bin.to_string_lossy().into_owned()));
                }
            }
            Ok(templates.render(templates::NODE_RED_UNIT, &ctx)?.into_bytes())
        },
    )
}

/// Build the full gateway registry for a deployment.
#[must_use]
pub fn gateway_registry(
    deployment: &Deployment,
    templates: TemplateSet,
) -> StepRegistry<dyn System> {
    let config = &deployment.config;
    let paths = &deployment.paths;
    let user = deployment.identity.user.as_str();
    let templates = Rc::new(templates);
    let context = Rc::new(templates::render_context(deployment));
    let root_file = || FilePerms::root(0o644);

    let mut registry: StepRegistry<dyn System> = StepRegistry::new();

    // Wireless access point.
    registry
        .register(ManagedStep::new(
            "ap.packages",
            "Install access point packages",
            Packages::new(AP_PACKAGES.iter().copied()),
        ))
        .register(
            ManagedStep::new(
                "ap.dhcpcd",
                "Configure static address for the AP interface",
                rendered(&templates, &context, templates::DHCPCD, DHCPCD_CONF, root_file()),
            )
            .after("ap.packages"),
        )
        .register(
            ManagedStep::new(
                "ap.hostapd-conf",
                "Configure hostapd",
                rendered(
                    &templates,
                    &context,
                    templates::HOSTAPD,
                    HOSTAPD_CONF,
                    FilePerms::root(0o600),
                ),
            )
            .after("ap.packages"),
        )
        .register(
            ManagedStep::new(
                "ap.hostapd-default",
                "Point hostapd at its configuration",
                ManagedFile::fixed(
                    HOSTAPD_DEFAULT,
                    root_file(),
                    format!("DAEMON_CONF=\"{HOSTAPD_CONF}\"\n"),
                ),
            )
            .after("ap.packages"),
        )
        .register(
            ManagedStep::new(
                "ap.dnsmasq-conf",
                "Configure DHCP and DNS for AP clients",
                rendered(&templates, &context, templates::DNSMASQ, DNSMASQ_CONF, root_file()),
            )
            .after("ap.packages"),
        );

    // Host identity and routing.
    registry
        .register(ManagedStep::new(
            "host.hostname",
            format!("Set hostname to {}", config.hostname),
            Hostname::new(config.hostname.clone()),
        ))
        .register(ManagedStep::new(
            "host.ip-forward",
            "Enable IPv4 forwarding",
            Sysctl::new("net.ipv4.ip_forward", "1"),
        ));

    registry
        .register(
            ManagedStep::new(
                "svc.hostapd",
                "Start hostapd",
                Service::new("hostapd")
                    .watching(HOSTAPD_CONF)
                    .watching(HOSTAPD_DEFAULT),
            )
            .after_all(["ap.hostapd-conf", "ap.hostapd-default", "ap.dhcpcd"]),
        )
        .register(
            ManagedStep::new(
                "svc.dnsmasq",
                "Start dnsmasq",
                Service::new("dnsmasq").watching(DNSMASQ_CONF),
            )
            .after_all(["ap.dnsmasq-conf", "ap.dhcpcd", "host.hostname"]),
        )
        .register(
            ManagedStep::new(
                "svc.avahi-daemon",
                "Start avahi-daemon",
                Service::new("avahi-daemon").watching("/etc/hostname"),
            )
            .after_all(["ap.packages", "host.hostname"]),
        );

    // MQTT broker.
    registry
        .register(ManagedStep::new(
            "broker.packages",
            "Install Mosquitto",
            Packages::new(BROKER_PACKAGES.iter().copied()),
        ))
        .register(
            ManagedStep::new(
                "broker.config",
                "Configure Mosquitto",
                rendered(
                    &templates,
                    &context,
                    templates::MOSQUITTO,
                    MOSQUITTO_CONF,
                    root_file(),
                ),
            )
            .after("broker.packages"),
        )
        .register(
            ManagedStep::new(
                "broker.passwd",
                "Set broker credentials",
                MosquittoPassword::new(
                    MOSQUITTO_PASSWD,
                    config.mqtt.username.clone(),
                    config.mqtt.password.clone(),
                ),
            )
            .after("broker.packages"),
        )
        .register(
            ManagedStep::new(
                "svc.mosquitto",
                "Start Mosquitto",
                Service::new("mosquitto")
                    .watching(MOSQUITTO_CONF)
                    .watching(MOSQUITTO_PASSWD),
            )
            .after_all(["broker.config", "broker.passwd"]),
        );

    // Time-series store.
    let vm_unit = unit_path("victoria-metrics");
    registry
        .register(ManagedStep::new(
            "tsdb.binary",
            format!("Install VictoriaMetrics {}", config.victoria_metrics.version),
            ReleaseBinary::new(
                config.victoria_metrics.download_url(),
                "victoria-metrics-prod",
                templates::VM_BINARY,
            ),
        ))
        .register(ManagedStep::new(
            "tsdb.user",
            "Create victoria-metrics user",
            SystemUser::new(VM_USER),
        ))
        .register(
            ManagedStep::new(
                "tsdb.data-dir",
                "Create VictoriaMetrics data directory",
                OwnedDir::new(templates::VM_DATA_DIR, VM_USER),
            )
            .after("tsdb.user"),
        )
        .register(ManagedStep::new(
            "tsdb.scrape-config",
            "Configure VictoriaMetrics scraping",
            rendered(
                &templates,
                &context,
                templates::VM_SCRAPE,
                templates::VM_SCRAPE_CONFIG,
                root_file(),
            ),
        ))
        .register(
            ManagedStep::new(
                "tsdb.unit",
                "Install VictoriaMetrics unit",
                rendered(&templates, &context, templates::VM_UNIT, &vm_unit, root_file()),
            )
            .after("tsdb.binary"),
        )
        .register(
            ManagedStep::new(
                "svc.victoria-metrics",
                "Start VictoriaMetrics",
                Service::new("victoria-metrics")
                    .watching(&vm_unit)
                    .watching(templates::VM_SCRAPE_CONFIG),
            )
            .after_all(["tsdb.unit", "tsdb.data-dir", "tsdb.scrape-config"]),
        );

    // Flow editor.
    let settings = paths.node_red_dir.join("settings.js");
    registry
        .register(ManagedStep::new(
            "flows.runtime-packages",
            "Install Node.js runtime",
            Packages::new(FLOWS_PACKAGES.iter().copied()),
        ))
        .register(
            ManagedStep::new(
                "flows.node-red",
                "Install Node-RED",
                NpmGlobal::new(NODE_RED_PACKAGE, NODE_RED_PROGRAM),
            )
            .after("flows.runtime-packages"),
        )
        .register(ManagedStep::new(
            "flows.user-dir",
            "Create Node-RED user directory",
            OwnedDir::new(&paths.node_red_dir, user),
        ))
        .register(
            ManagedStep::new(
                "flows.settings",
                "Configure Node-RED",
                rendered(
                    &templates,
                    &context,
                    templates::NODE_RED_SETTINGS,
                    &settings,
                    FilePerms::owned_by(user, 0o644),
                ),
            )
            .after("flows.user-dir"),
        )
        .register(
            ManagedStep::new(
                "flows.unit",
                "Install Node-RED unit",
                node_red_unit(&templates, &context),
            )
            .after("flows.node-red"),
        )
        .register(
            ManagedStep::new(
                "svc.nodered",
                "Start Node-RED",
                Service::new("nodered")
                    .watching(unit_path("nodered"))
                    .watching(&settings),
            )
            .after_all(["flows.unit", "flows.settings", "svc.mosquitto"]),
        );

    // Dashboard.
    let dashboard_unit = unit_path("sysohub-dashboard");
    registry
        .register(ManagedStep::new(
            "dashboard.packages",
            "Install dashboard dependencies",
            Packages::new(DASHBOARD_PACKAGES.iter().copied()),
        ))
        .register(ManagedStep::new(
            "dashboard.app",
            "Install dashboard application",
            ManagedFile::copy_of(
                &paths.dashboard_app_source,
                &paths.dashboard_app,
                FilePerms::owned_by(user, 0o644),
            ),
        ))
        .register(ManagedStep::new(
            "dashboard.unit",
            "Install dashboard unit",
            rendered(
                &templates,
                &context,
                templates::DASHBOARD_UNIT,
                &dashboard_unit,
                root_file(),
            ),
        ))
        .register(
            ManagedStep::new(
                "svc.sysohub-dashboard",
                "Start dashboard",
                Service::new("sysohub-dashboard")
                    .watching(&dashboard_unit)
                    .watching(&paths.dashboard_app),
            )
            .after_all([
                "dashboard.packages",
                "dashboard.app",
                "dashboard.unit",
                "svc.mosquitto",
                "svc.victoria-metrics",
            ]),
        );

    registry
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::tests::sample_deployment;
    use crate::orchestrator::{Orchestrator, StepOutcome};
    use crate::state::{SetupState, StateStore};
    use crate::system::fake::FakeSystem;

    fn registry(dir: &TempDir) -> StepRegistry<dyn System> {
        let deployment = sample_deployment(dir.path());
        gateway_registry(&deployment, TemplateSet::embedded().unwrap())
    }

    /// A fake host where every tool a step shells out to behaves.
    fn host(dir: &TempDir) -> FakeSystem {
        let sys = FakeSystem::default();
        sys.put_file("/etc/hosts", b"127.0.0.1\tlocalhost\n");
        sys.put_file(
            &dir.path().join("templates/flask_app.py").to_string_lossy(),
            b"app = Flask(__name__)\n",
        );
        sys.set_output("sysctl -n net.ipv4.ip_forward", "1");
        sys.programs
            .borrow_mut()
            .insert("node-red".into(), "/usr/bin/node-red".into());
        sys.executables
            .borrow_mut()
            .insert(templates::VM_BINARY.into());
        sys
    }

    #[test]
    fn test_registry_orders_without_cycles() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let order: Vec<String> = registry
            .resolve_order()
            .unwrap()
            .iter()
            .map(|s| s.id().to_string())
            .collect();

        let pos = |id: &str| order.iter().position(|s| s == id).unwrap();
        assert!(pos("broker.config") < pos("svc.mosquitto"));
        assert!(pos("svc.mosquitto") < pos("svc.nodered"));
        assert!(pos("tsdb.user") < pos("tsdb.data-dir"));
        assert!(pos("svc.victoria-metrics") < pos("svc.sysohub-dashboard"));
    }

    #[test]
    fn test_every_managed_unit_has_a_service_step() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        for unit in MANAGED_UNITS {
            assert!(registry.get(&format!("svc.{unit}")).is_some(), "{unit}");
        }
    }

    #[test]
    fn test_full_run_converges_then_is_noop() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let sys = host(&dir);
        let orch = Orchestrator::new(StateStore::new(dir.path().join("state.json")));

        let first = orch
            .run::<dyn System>(&registry, &sys, SetupState::new())
            .unwrap();
        assert!(first.is_success(), "{:?}", first.failure);
        assert_eq!(first.state.len(), registry.len());

        let restarts = sys.restarts.borrow().len();
        let second = orch
            .run::<dyn System>(&registry, &sys, first.state)
            .unwrap();
        assert!(second.applied().is_empty(), "{:?}", second.applied());
        assert_eq!(second.count(StepOutcome::Verified), registry.len());
        assert_eq!(sys.restarts.borrow().len(), restarts);
    }

    #[test]
    fn test_changed_broker_config_restarts_only_broker_chain() {
        let dir = TempDir::new().unwrap();
        let sys = host(&dir);
        let orch = Orchestrator::new(StateStore::new(dir.path().join("state.json")));
        let first = orch
            .run::<dyn System>(&registry(&dir), &sys, SetupState::new())
            .unwrap();

        let mut deployment = sample_deployment(dir.path());
        deployment.config.mqtt.port = 1884;
        let updated = gateway_registry(&deployment, TemplateSet::embedded().unwrap());
        sys.restarts.borrow_mut().clear();

        let second = orch
            .run::<dyn System>(&updated, &sys, first.state)
            .unwrap();
        let applied = second.applied();
        assert!(applied.contains(&"broker.config"));
        assert!(applied.contains(&"svc.mosquitto"));
        assert!(!applied.contains(&"svc.hostapd"));
        assert!(sys.restarts.borrow().contains(&"mosquitto".to_string()));
        assert!(!sys.restarts.borrow().contains(&"hostapd".to_string()));
    }

    #[test]
    fn test_node_red_unit_uses_resolved_paths() {
        let dir = TempDir::new().unwrap();
        let sys = host(&dir);
        let deployment = sample_deployment(dir.path());
        let templates = Rc::new(TemplateSet::embedded().unwrap());
        let context = Rc::new(templates::render_context(&deployment));
        let unit = node_red_unit(&templates, &context);
        let text = String::from_utf8(unit.desired(&sys).unwrap()).unwrap();
        assert!(text.contains("ExecStart=/usr/bin/node /usr/bin/node-red"));
        assert!(text.contains("User=pi"));
    }
}
