mod common;

use common::{gradient, jpeg, png};
use dxgate::error::ErrorKind;
use dxgate::ingest::ImageIngestor;
use dxgate::preprocess::{
    Normalization, PreprocessConfig, Preprocessor, ResizeFilter, TensorShape,
};
use image::{DynamicImage, ImageFormat, Luma, Rgb, RgbImage};

fn ingest(bytes: Vec<u8>, mime: &str) -> dxgate::ingest::ImageBlob {
    ImageIngestor::default().ingest(bytes, mime).unwrap()
}

#[test]
fn identical_bytes_give_bit_identical_tensors() {
    let bytes = jpeg(512, 384);
    let preprocessor = Preprocessor::default();
    let shape = TensorShape::new(224, 224, 3);

    let a = preprocessor
        .preprocess(&ingest(bytes.clone(), "image/jpeg"), shape)
        .unwrap();
    let b = preprocessor
        .preprocess(&ingest(bytes, "image/jpeg"), shape)
        .unwrap();

    let bits = |t: &dxgate::preprocess::Tensor| -> Vec<u32> {
        t.to_vec().into_iter().map(f32::to_bits).collect()
    };
    assert_eq!(bits(&a), bits(&b));
}

#[test]
fn output_has_exactly_the_target_shape() {
    let preprocessor = Preprocessor::default();
    let blob = ingest(png(37, 91), "image/png");

    for shape in [
        TensorShape::new(224, 224, 3),
        TensorShape::new(128, 64, 1),
        TensorShape::new(1, 1, 3),
    ] {
        let tensor = preprocessor.preprocess(&blob, shape).unwrap();
        assert_eq!(tensor.shape(), shape);
        assert_eq!(tensor.to_vec().len(), shape.len());
    }
}

#[test]
fn min_max_normalization_maps_into_unit_range() {
    let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([255, 255, 255])));
    let black = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([0, 0, 0])));
    let preprocessor = Preprocessor::default();
    let shape = TensorShape::new(4, 4, 3);

    let white = preprocessor.transform(&white, shape).unwrap();
    let black = preprocessor.transform(&black, shape).unwrap();
    assert!(white.to_vec().iter().all(|&v| (v - 1.0).abs() < 1e-5));
    assert!(black.to_vec().iter().all(|&v| v == 0.0));

    let mixed = preprocessor.transform(&gradient(64, 64), shape).unwrap();
    assert!(mixed.to_vec().iter().all(|&v| (-1e-5..=1.0 + 1e-5).contains(&v)));
}

#[test]
fn imagenet_normalization_centres_channels() {
    let preprocessor = Preprocessor::new(PreprocessConfig {
        filter: ResizeFilter::Bilinear,
        normalization: Normalization::imagenet(),
    })
    .unwrap();
    let grey = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([124, 116, 104])));
    let tensor = preprocessor.transform(&grey, TensorShape::new(2, 2, 3)).unwrap();

    // 124/255 ≈ 0.486, 116/255 ≈ 0.455, 104/255 ≈ 0.408: all near the mean
    assert!(tensor.to_vec().iter().all(|v| v.abs() < 0.02));
}

#[test]
fn grayscale_sources_expand_to_three_channels() {
    let luma = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(10, 10, Luma([51])));
    let bytes = common::encode(&luma, ImageFormat::Png);
    let tensor = Preprocessor::default()
        .preprocess(&ingest(bytes, "image/png"), TensorShape::new(5, 5, 3))
        .unwrap();
    assert!(tensor.to_vec().iter().all(|&v| (v - 0.2).abs() < 1e-6));
}

#[test]
fn corrupt_payload_is_a_decode_error() {
    let mut bytes = png(32, 32);
    let len = bytes.len();
    bytes.truncate(len / 2);
    let err = Preprocessor::default()
        .decode(&ingest(bytes, "image/png"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DecodeError);
}

#[test]
fn unsupported_channel_counts_are_rejected() {
    let err = Preprocessor::default()
        .transform(&gradient(8, 8), TensorShape::new(4, 4, 4))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);
}

#[test]
fn nearest_and_bilinear_differ_on_gradients() {
    let image = gradient(100, 100);
    let shape = TensorShape::new(7, 7, 3);
    let bilinear = Preprocessor::default().transform(&image, shape).unwrap();
    let nearest = Preprocessor::new(PreprocessConfig {
        filter: ResizeFilter::Nearest,
        ..PreprocessConfig::default()
    })
    .unwrap()
    .transform(&image, shape)
    .unwrap();
    assert_eq!(bilinear.shape(), nearest.shape());
    assert_ne!(bilinear.to_vec(), nearest.to_vec());
}
