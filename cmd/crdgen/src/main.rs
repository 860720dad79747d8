use kube::CustomResourceExt;
use someapp_operator::crd::someapp::Someapp;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&Someapp::crd()).expect("CRD serializes to yaml")
    )
}
