use storeop_store::crd::Store;

use kube::CustomResourceExt;

fn main() {
    // safe unwrap: we know the CRD is serializable
    print!("---\n{}\n", serde_yaml::to_string(&Store::crd()).unwrap());
}
