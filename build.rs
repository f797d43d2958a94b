fn main() {
    // DuckDB (bundled) on Windows needs the Restart Manager library
    // (RmStartSession, RmEndSession, RmRegisterResources, RmGetList).
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("windows") {
        println!("cargo:rustc-link-lib=Rstrtmgr");
    }
}
