use chrono::Utc;

// 把构建时间烧进二进制，启动横幅与 /api/health 都会带上，
// 方便确认线上跑的是哪个版本的聚合服务
fn main() {
    let build_time = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    println!("cargo:rustc-env=YAOSOU_BUILD_TIME={}", build_time);
    println!("cargo:rerun-if-changed=build.rs");
}
