//! Reference image preparation before vision encoding

use std::str::FromStr;

use image::{DynamicImage, GenericImageView, Rgba, RgbaImage, imageops};

use crate::error::IpAdapterError;

/// How a reference image is prepared for the vision encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrepMode {
    /// Centre on a square black canvas
    Pad,
    /// Crop to the detected face
    CropFace,
    /// Leave unchanged
    #[default]
    None,
}

impl FromStr for PrepMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pad" | "padding" => Ok(Self::Pad),
            "crop-face" | "face-crop" | "face_crop" | "face" => Ok(Self::CropFace),
            "none" => Ok(Self::None),
            other => Err(format!("unknown preprocessing mode: {other}")),
        }
    }
}

/// Axis-aligned region in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Locates a face in an image
pub trait FaceDetector {
    /// Bounding box of the most prominent face, if any
    fn detect(&self, image: &DynamicImage) -> Option<FaceBox>;
}

/// Centre `image` on a black square canvas whose side is its longer edge
pub fn pad_to_square(image: &DynamicImage) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width == height {
        return image.clone();
    }

    let side = width.max(height);
    let mut canvas = RgbaImage::from_pixel(side, side, Rgba([0, 0, 0, 255]));
    let x = i64::from((side - width) / 2);
    let y = i64::from((side - height) / 2);
    imageops::overlay(&mut canvas, &image.to_rgba8(), x, y);

    DynamicImage::ImageRgba8(canvas)
}

/// Crop `image` to the face found by `detector`
pub fn face_crop(
    image: &DynamicImage,
    detector: &dyn FaceDetector,
) -> Result<DynamicImage, IpAdapterError> {
    let face = detector
        .detect(image)
        .ok_or_else(|| IpAdapterError::Preprocess("no face detected".to_string()))?;

    let (width, height) = image.dimensions();
    let x = face.x.min(width);
    let y = face.y.min(height);
    let crop_width = face.width.min(width - x);
    let crop_height = face.height.min(height - y);
    if crop_width == 0 || crop_height == 0 {
        return Err(IpAdapterError::Preprocess(format!(
            "face box {face:?} lies outside the {width}x{height} image"
        )));
    }

    Ok(image.crop_imm(x, y, crop_width, crop_height))
}

/// Prepare `image` according to `mode`
///
/// `detector` is only consulted for [`PrepMode::CropFace`] and must be given
/// in that mode.
pub fn prepare(
    image: DynamicImage,
    mode: PrepMode,
    detector: Option<&dyn FaceDetector>,
) -> Result<DynamicImage, IpAdapterError> {
    match mode {
        PrepMode::Pad => Ok(pad_to_square(&image)),
        PrepMode::CropFace => {
            let detector = detector.ok_or_else(|| {
                IpAdapterError::Preprocess("face crop requires a face detector".to_string())
            })?;
            face_crop(&image, detector)
        }
        PrepMode::None => Ok(image),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    struct Fixed(Option<FaceBox>);

    impl FaceDetector for Fixed {
        fn detect(&self, _image: &DynamicImage) -> Option<FaceBox> {
            self.0
        }
    }

    fn white(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([255, 255, 255])))
    }

    #[test]
    fn test_pad_wide_image() {
        let padded = pad_to_square(&white(8, 4));
        assert_eq!(padded.dimensions(), (8, 8));

        let rgba = padded.to_rgba8();
        assert_eq!(rgba.get_pixel(0, 0), &Rgba([0, 0, 0, 255]));
        assert_eq!(rgba.get_pixel(0, 2), &Rgba([255, 255, 255, 255]));
        assert_eq!(rgba.get_pixel(7, 5), &Rgba([255, 255, 255, 255]));
        assert_eq!(rgba.get_pixel(7, 6), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_pad_square_is_noop() {
        let padded = pad_to_square(&white(5, 5));
        assert_eq!(padded.dimensions(), (5, 5));
    }

    #[test]
    fn test_face_crop() {
        let detector = Fixed(Some(FaceBox {
            x: 2,
            y: 1,
            width: 3,
            height: 4,
        }));
        let detector: &dyn FaceDetector = &detector;
        let out = prepare(white(10, 10), PrepMode::CropFace, Some(detector)).unwrap();
        assert_eq!(out.dimensions(), (3, 4));
    }

    #[test]
    fn test_face_crop_clamped() {
        let detector = Fixed(Some(FaceBox {
            x: 6,
            y: 6,
            width: 10,
            height: 10,
        }));
        let out = face_crop(&white(8, 8), &detector).unwrap();
        assert_eq!(out.dimensions(), (2, 2));
    }

    #[test]
    fn test_face_crop_errors() {
        let err = face_crop(&white(8, 8), &Fixed(None)).unwrap_err();
        assert!(matches!(err, IpAdapterError::Preprocess(_)));

        let outside = Fixed(Some(FaceBox {
            x: 20,
            y: 0,
            width: 4,
            height: 4,
        }));
        assert!(face_crop(&white(8, 8), &outside).is_err());

        assert!(prepare(white(8, 8), PrepMode::CropFace, None).is_err());
    }

    #[test]
    fn test_none_passthrough() {
        let out = prepare(white(7, 3), PrepMode::None, None).unwrap();
        assert_eq!(out.dimensions(), (7, 3));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("padding".parse(), Ok(PrepMode::Pad));
        assert_eq!("face_crop".parse(), Ok(PrepMode::CropFace));
        assert_eq!("None".parse(), Ok(PrepMode::None));
        assert!("blur".parse::<PrepMode>().is_err());
    }
}
