use assert_cmd::Command;
use filetime::FileTime;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use tempfile::TempDir;

fn combined_output(output: &std::process::Output) -> String {
    format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn webpdeep() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("webpdeep"))
}

fn encode_png(width: u32, height: u32) -> Vec<u8> {
    let mut img = image::RgbaImage::new(width, height);
    for (x, y, p) in img.enumerate_pixels_mut() {
        *p = image::Rgba([
            (x * 7 % 256) as u8,
            (y * 13 % 256) as u8,
            ((x + y) * 3 % 256) as u8,
            255,
        ]);
    }
    let mut out = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut out), image::ImageOutputFormat::Png)
        .expect("encode png");
    out
}

fn encode_jpeg(width: u32, height: u32) -> Vec<u8> {
    let mut img = image::RgbImage::new(width, height);
    for (x, y, p) in img.enumerate_pixels_mut() {
        *p = image::Rgb([(x * 11 % 256) as u8, (y * 5 % 256) as u8, 77]);
    }
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(
            &mut Cursor::new(&mut out),
            image::ImageOutputFormat::Jpeg(90),
        )
        .expect("encode jpeg");
    out
}

fn png_chunk(fourcc: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + data.len());
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(data);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(fourcc);
    hasher.update(data);
    out.extend_from_slice(&hasher.finalize().to_be_bytes());
    out
}

/// Inserts ancillary chunks right after IHDR of an encoded PNG.
fn splice_after_ihdr(png: &[u8], chunks: &[Vec<u8>]) -> Vec<u8> {
    let ihdr_len = u32::from_be_bytes(png[8..12].try_into().unwrap()) as usize;
    let ihdr_end = 8 + 12 + ihdr_len;
    let mut out = png[..ihdr_end].to_vec();
    for c in chunks {
        out.extend_from_slice(c);
    }
    out.extend_from_slice(&png[ihdr_end..]);
    out
}

fn png_with_iccp(width: u32, height: u32, profile: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut data = b"test-profile".to_vec();
    data.push(0);
    data.push(0);
    let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(profile).unwrap();
    data.extend_from_slice(&enc.finish().unwrap());
    splice_after_ihdr(&encode_png(width, height), &[png_chunk(b"iCCP", &data)])
}

fn decode_webp_file(path: &Path) -> (u32, u32) {
    let data = fs::read(path).expect("read webp output");
    let decoded = webp::Decoder::new(&data)
        .decode()
        .unwrap_or_else(|| panic!("{} is not decodable webp", path.display()));
    (decoded.width(), decoded.height())
}

fn log_text(dir: &Path) -> String {
    let log = fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.path())
        .find(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with("webpdeep-"))
                .unwrap_or(false)
                && p.extension().map(|e| e == "log").unwrap_or(false)
        })
        .expect("log file created");
    fs::read_to_string(log).unwrap()
}

#[test]
fn single_png_converts_next_to_the_source() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("a.png");
    fs::write(&src, png_with_iccp(64, 48, b"icc-profile-payload")).unwrap();

    let out = webpdeep().arg(&src).output().expect("run");
    assert!(out.status.success(), "{}", combined_output(&out));

    let webp_path = tmp.path().join("a.webp");
    assert_eq!(decode_webp_file(&webp_path), (64, 48));

    // No --image_meta, so no ICC profile lands in the container.
    let chunks = webpdeep::riff::parse(&fs::read(&webp_path).unwrap()).unwrap();
    assert!(chunks.iter().all(|c| c.fourcc != webpdeep::riff::CHUNK_ICCP));
}

#[test]
fn image_meta_flag_carries_the_icc_profile_over() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("a.png");
    let profile = b"icc-profile-payload-0123456789";
    fs::write(&src, png_with_iccp(32, 32, profile)).unwrap();

    let out = webpdeep().arg(&src).arg("--image_meta").output().expect("run");
    assert!(out.status.success(), "{}", combined_output(&out));

    let data = fs::read(tmp.path().join("a.webp")).unwrap();
    let chunks = webpdeep::riff::parse(&data).unwrap();
    let iccp = chunks
        .iter()
        .find(|c| c.fourcc == webpdeep::riff::CHUNK_ICCP)
        .expect("ICCP chunk present");
    assert_eq!(iccp.data, profile);
    // Still a decodable image stream.
    assert!(webp::Decoder::new(&data).decode().is_some());
}

#[test]
fn non_recursive_directory_skips_subdirectories() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("in");
    let dst = tmp.path().join("out");
    fs::create_dir_all(src.join("sub")).unwrap();
    fs::write(src.join("a.png"), encode_png(16, 16)).unwrap();
    fs::write(src.join("sub/b.png"), encode_png(16, 16)).unwrap();

    let out = webpdeep()
        .arg(&src)
        .arg("-o")
        .arg(&dst)
        .output()
        .expect("run");
    assert!(out.status.success(), "{}", combined_output(&out));

    assert_eq!(decode_webp_file(&dst.join("a.webp")), (16, 16));
    assert!(!dst.join("sub").exists());
}

#[test]
fn recursive_run_with_copy_mirrors_the_tree() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("in");
    let dst = tmp.path().join("out");
    fs::create_dir_all(src.join("sub")).unwrap();
    fs::write(src.join("a.png"), encode_png(20, 10)).unwrap();
    fs::write(src.join("notes.txt"), b"keep me verbatim").unwrap();
    fs::write(src.join("sub/b.jpg"), encode_jpeg(12, 12)).unwrap();

    let out = webpdeep()
        .arg(&src)
        .arg("-r")
        .arg("--copy=*.txt")
        .arg("-o")
        .arg(&dst)
        .output()
        .expect("run");
    assert!(out.status.success(), "{}", combined_output(&out));

    assert_eq!(decode_webp_file(&dst.join("a.webp")), (20, 10));
    assert_eq!(decode_webp_file(&dst.join("sub/b.webp")), (12, 12));
    assert_eq!(
        fs::read(dst.join("notes.txt")).unwrap(),
        b"keep me verbatim"
    );
    // Unmatched files yield no output.
    assert!(!dst.join("notes.webp").exists());
}

#[test]
fn file_meta_flag_propagates_mode_and_mtime() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("in");
    let dst = tmp.path().join("out");
    fs::create_dir_all(&src).unwrap();
    let png = src.join("a.png");
    fs::write(&png, encode_png(8, 8)).unwrap();
    let old = FileTime::from_unix_time(1_600_000_000, 0);
    filetime::set_file_mtime(&png, old).unwrap();

    let out = webpdeep()
        .arg(&src)
        .arg("--file_meta")
        .arg("-o")
        .arg(&dst)
        .output()
        .expect("run");
    assert!(out.status.success(), "{}", combined_output(&out));

    let meta = fs::metadata(dst.join("a.webp")).unwrap();
    let got = FileTime::from_system_time(meta.modified().unwrap());
    assert!((got.unix_seconds() - old.unix_seconds()).abs() <= 1);
}

#[test]
fn lossless_exact_check_finishes_without_warnings() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("alpha.png");
    let mut img = image::RgbaImage::new(10, 10);
    for (x, y, p) in img.enumerate_pixels_mut() {
        let alpha = if (x + y) % 3 == 0 { 0 } else { 255 };
        *p = image::Rgba([x as u8 * 20, y as u8 * 20, 40, alpha]);
    }
    let mut png = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut png), image::ImageOutputFormat::Png)
        .unwrap();
    fs::write(&src, png).unwrap();

    let out = webpdeep()
        .arg(&src)
        .arg("--lossless")
        .arg("--exact")
        .arg("--check_image")
        .output()
        .expect("run");
    assert!(out.status.success(), "{}", combined_output(&out));

    let text = log_text(tmp.path());
    let last = text.lines().last().expect("final counter line");
    assert!(last.contains("conv: 1/1"), "unexpected log line: {last}");
    assert!(last.contains("warn: 0"), "unexpected warnings: {text}");
}

#[test]
fn per_job_failures_do_not_fail_the_run() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("in");
    let dst = tmp.path().join("out");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("broken.png"), b"this is not a png").unwrap();
    fs::write(src.join("good.png"), encode_png(6, 6)).unwrap();

    let out = webpdeep()
        .arg(&src)
        .arg("-o")
        .arg(&dst)
        .output()
        .expect("run");
    assert!(out.status.success(), "{}", combined_output(&out));

    assert_eq!(decode_webp_file(&dst.join("good.webp")), (6, 6));
    let text = log_text(&dst);
    assert!(text.contains("[ERROR]"), "expected a job error: {text}");
    let last = text.lines().last().unwrap();
    assert!(last.contains("conv: 1/2"), "unexpected log line: {last}");
    assert!(last.contains("error: 1"), "unexpected log line: {last}");
}

#[test]
fn parallel_workers_convert_a_larger_tree() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("in");
    let dst = tmp.path().join("out");
    fs::create_dir_all(&src).unwrap();
    for i in 0..12 {
        fs::write(src.join(format!("img-{i:02}.png")), encode_png(24, 24)).unwrap();
    }

    let out = webpdeep()
        .arg(&src)
        .arg("--max_go")
        .arg("4")
        .arg("-o")
        .arg(&dst)
        .output()
        .expect("run");
    assert!(out.status.success(), "{}", combined_output(&out));

    for i in 0..12 {
        assert_eq!(
            decode_webp_file(&dst.join(format!("img-{i:02}.webp"))),
            (24, 24)
        );
    }
}

#[test]
fn missing_input_argument_is_a_setup_error() {
    let out = webpdeep().output().expect("run");
    assert!(!out.status.success());
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn directory_without_output_is_a_setup_error() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("in");
    fs::create_dir_all(&src).unwrap();
    let out = webpdeep().arg(&src).output().expect("run");
    assert!(!out.status.success());
    assert_eq!(out.status.code(), Some(1));
    assert!(combined_output(&out).contains("output not specified"));
}

#[test]
fn invalid_preset_is_a_setup_error() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("a.png");
    fs::write(&src, encode_png(4, 4)).unwrap();
    let out = webpdeep()
        .arg(&src)
        .arg("--preset")
        .arg("sketchy")
        .output()
        .expect("run");
    assert!(!out.status.success());
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn version_flag_prints_encoder_version_and_exits_zero() {
    let out = webpdeep().arg("-v").output().expect("run");
    assert!(out.status.success());
    assert!(combined_output(&out).contains("WebP encoder version"));
}

#[test]
fn help_exits_zero() {
    let out = webpdeep().arg("--help").output().expect("run");
    assert!(out.status.success());
    assert!(combined_output(&out).contains("--image_meta"));
}
