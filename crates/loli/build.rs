fn main() {
    let mut build = cc::Build::new();

    build
        .static_crt(true)
        .flag_if_supported("-std=c11")
        .flag_if_supported("/MD")
        .opt_level(3);

    println!("cargo:rerun-if-changed=src/helper/helper.c");
    build.file("src/helper/helper.c");
    build.compile("loli_helper_c");
}
