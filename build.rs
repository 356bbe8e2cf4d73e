fn main() {
    let target = std::env::var("TARGET").unwrap_or_default();

    if target.contains("musl") {
        // musl targets: link manually built static libraries, no pkg-config
        if let Ok(sysroot) = std::env::var("MUSL_SYSROOT") {
            println!("cargo:rustc-link-search=native={}/usr/lib", sysroot);
        }
        println!("cargo:rustc-link-lib=static=speex");
        println!("cargo:rustc-link-lib=static=speexdsp");
        return;
    }

    // ALSA linkage is handled by alsa-sys. The codec (libspeex) and DSP
    // (libspeexdsp) libraries are located through pkg-config.
    pkg_config::Config::new()
        .probe("speex")
        .expect("Failed to find speex. Please install libspeex-dev.");
    pkg_config::Config::new()
        .probe("speexdsp")
        .expect("Failed to find speexdsp. Please install libspeexdsp-dev.");
}
