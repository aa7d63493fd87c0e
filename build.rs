fn main() {
    if !(cfg!(target_family = "unix") && cfg!(target_pointer_width = "64")) {
        panic!(
            "{} only works on 64-bit unix targets (the GCI library is not shipped for others)",
            env!("CARGO_PKG_NAME")
        );
    }

    println!("cargo:rerun-if-env-changed=GEMSTONE");
}
