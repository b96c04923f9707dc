use kube::CustomResourceExt;

use hobbyfarm_operator::resources::{
    accesscodes::{AccessCode, OneTimeAccessCode},
    dynamicbindconfigurations::DynamicBindConfiguration,
    environments::{Environment, VirtualMachineTemplate},
    progress::Progress,
    scheduledevents::ScheduledEvent,
    sessions::Session,
    virtualmachineclaims::VirtualMachineClaim,
    virtualmachines::VirtualMachine,
    virtualmachinesets::VirtualMachineSet,
};

fn main() {
    let crds = [
        ScheduledEvent::crd(),
        VirtualMachineSet::crd(),
        VirtualMachine::crd(),
        VirtualMachineClaim::crd(),
        DynamicBindConfiguration::crd(),
        AccessCode::crd(),
        OneTimeAccessCode::crd(),
        Session::crd(),
        Progress::crd(),
        Environment::crd(),
        VirtualMachineTemplate::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd).unwrap())
    }
}
