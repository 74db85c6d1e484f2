use crate::error::{Result, TreeTileError};
use crate::geo::GeoTransform;
use crate::raster::Raster;
use log::{debug, info, warn};
use ndarray::{Array2, Array3, Axis};
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::colortype::{Gray16, RGB16, RGBA16};
use tiff::encoder::{DirectoryEncoder, TiffEncoder, TiffKind};
use tiff::tags::Tag;
use tiff::ColorType;

// GeoTIFF tags
const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;

// GeoKeys
const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// Read an unsigned 16-bit GeoTIFF into a `(channels, height, width)` raster.
pub fn read_raster<P: AsRef<Path>>(path: P) -> Result<Raster> {
    let path = path.as_ref();
    info!("Opening raster: {}", path.display());
    let mut decoder = Decoder::new(BufReader::new(File::open(path)?))?;

    let (width, height) = decoder.dimensions()?;
    let (width, height) = (width as usize, height as usize);
    if width == 0 || height == 0 {
        return Err(TreeTileError::InvalidDimensions(width, height));
    }

    let channels = match decoder.colortype()? {
        ColorType::Gray(16) => 1,
        ColorType::GrayA(16) => 2,
        ColorType::RGB(16) => 3,
        ColorType::RGBA(16) => 4,
        ColorType::Multiband {
            bit_depth: 16,
            num_samples,
        } => num_samples as usize,
        other => {
            return Err(TreeTileError::UnsupportedSampleFormat(format!(
                "{:?} in {}",
                other,
                path.display()
            )))
        }
    };

    let transform = read_transform(&mut decoder)?.unwrap_or_else(|| {
        warn!("{} has no georeferencing, using identity transform", path.display());
        GeoTransform::identity()
    });
    let epsg = read_epsg(&mut decoder)?;

    let samples = match decoder.read_image()? {
        DecodingResult::U16(samples) => samples,
        _ => {
            return Err(TreeTileError::UnsupportedSampleFormat(format!(
                "{} does not decode to u16 samples",
                path.display()
            )))
        }
    };

    // Chunky (pixel-interleaved) samples to band-major.
    let data = Array3::from_shape_vec((height, width, channels), samples)?
        .permuted_axes([2, 0, 1])
        .as_standard_layout()
        .into_owned();

    debug!(
        "Raster {}: {} bands, {}x{}, transform {:?}, EPSG {:?}",
        path.display(),
        channels,
        height,
        width,
        transform.0,
        epsg
    );
    Raster::new(data, transform, epsg)
}

fn read_f64_tag<R: std::io::Read + Seek>(decoder: &mut Decoder<R>, tag: u16) -> Result<Option<Vec<f64>>> {
    Ok(decoder
        .find_tag(Tag::Unknown(tag))?
        .map(|value| value.into_f64_vec())
        .transpose()?)
}

fn read_transform<R: std::io::Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<GeoTransform>> {
    if let Some(m) = read_f64_tag(decoder, MODEL_TRANSFORMATION)? {
        if m.len() >= 8 {
            return Ok(Some(GeoTransform([m[3], m[0], m[1], m[7], m[4], m[5]])));
        }
    }

    let scale = read_f64_tag(decoder, MODEL_PIXEL_SCALE)?;
    let tiepoint = read_f64_tag(decoder, MODEL_TIEPOINT)?;
    match (scale, tiepoint) {
        (Some(scale), Some(tp)) if scale.len() >= 2 && tp.len() >= 6 => {
            let (sx, sy) = (scale[0], scale[1]);
            Ok(Some(GeoTransform([
                tp[3] - tp[0] * sx,
                sx,
                0.0,
                tp[4] + tp[1] * sy,
                0.0,
                -sy,
            ])))
        }
        _ => Ok(None),
    }
}

fn read_epsg<R: std::io::Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<u16>> {
    let Some(value) = decoder.find_tag(Tag::Unknown(GEO_KEY_DIRECTORY))? else {
        return Ok(None);
    };
    let keys = value.into_u16_vec()?;
    // Header is 4 shorts, then (key, location, count, value) entries.
    let epsg = keys
        .get(4..)
        .unwrap_or(&[])
        .chunks_exact(4)
        .find(|entry| {
            (entry[0] == PROJECTED_CS_TYPE_GEO_KEY || entry[0] == GEOGRAPHIC_TYPE_GEO_KEY) && entry[1] == 0
        })
        .map(|entry| entry[3]);
    Ok(epsg)
}

fn is_geographic(epsg: u16) -> bool {
    (4000..5000).contains(&epsg)
}

fn write_geotiff_tags<W: Write + Seek, K: TiffKind>(
    dir: &mut DirectoryEncoder<'_, W, K>,
    transform: &GeoTransform,
    epsg: Option<u16>,
) -> Result<()> {
    let [x0, dx, rx, y0, ry, dy] = transform.0;
    if transform.is_north_up() {
        let pixel_scale = [dx, -dy, 0.0];
        dir.write_tag(Tag::Unknown(MODEL_PIXEL_SCALE), &pixel_scale[..])?;
        let tiepoint = [0.0, 0.0, 0.0, x0, y0, 0.0];
        dir.write_tag(Tag::Unknown(MODEL_TIEPOINT), &tiepoint[..])?;
    } else {
        let matrix = [
            dx, rx, 0.0, x0, //
            ry, dy, 0.0, y0, //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ];
        dir.write_tag(Tag::Unknown(MODEL_TRANSFORMATION), &matrix[..])?;
    }

    if let Some(epsg) = epsg {
        let (model_type, crs_key) = if is_geographic(epsg) {
            (MODEL_TYPE_GEOGRAPHIC, GEOGRAPHIC_TYPE_GEO_KEY)
        } else {
            (MODEL_TYPE_PROJECTED, PROJECTED_CS_TYPE_GEO_KEY)
        };
        let keys: [u16; 16] = [
            1, 1, 0, 3, //
            GT_MODEL_TYPE_GEO_KEY, 0, 1, model_type, //
            GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA, //
            crs_key, 0, 1, epsg,
        ];
        dir.write_tag(Tag::Unknown(GEO_KEY_DIRECTORY), &keys[..])?;
    }
    Ok(())
}

/// Write a raster as a pixel-interleaved unsigned 16-bit GeoTIFF.
pub fn write_raster<P: AsRef<Path>>(path: P, raster: &Raster) -> Result<()> {
    let path = path.as_ref();
    info!("Writing raster: {}", path.display());
    let writer = BufWriter::new(File::create(path)?);
    let mut encoder = TiffEncoder::new(writer)?;

    let width = u32::try_from(raster.width()).map_err(|_| TreeTileError::InvalidDimensions(raster.width(), raster.height()))?;
    let height = u32::try_from(raster.height()).map_err(|_| TreeTileError::InvalidDimensions(raster.width(), raster.height()))?;
    let interleaved: Vec<u16> = raster.data().view().permuted_axes([1, 2, 0]).iter().copied().collect();

    match raster.channels() {
        1 => {
            let mut image = encoder.new_image::<Gray16>(width, height)?;
            write_geotiff_tags(image.encoder(), raster.transform(), raster.epsg())?;
            image.write_data(&interleaved)?;
        }
        3 => {
            let mut image = encoder.new_image::<RGB16>(width, height)?;
            write_geotiff_tags(image.encoder(), raster.transform(), raster.epsg())?;
            image.write_data(&interleaved)?;
        }
        4 => {
            let mut image = encoder.new_image::<RGBA16>(width, height)?;
            write_geotiff_tags(image.encoder(), raster.transform(), raster.epsg())?;
            image.write_data(&interleaved)?;
        }
        bands => write_multiband(&mut encoder, raster, width, height, bands, &interleaved)?,
    }

    debug!(
        "Wrote {} bands, {}x{} to {}",
        raster.channels(),
        raster.height(),
        raster.width(),
        path.display()
    );
    Ok(())
}

fn write_multiband<W: Write + Seek>(
    encoder: &mut TiffEncoder<W>,
    raster: &Raster,
    width: u32,
    height: u32,
    bands: usize,
    interleaved: &[u16],
) -> Result<()> {
    let samples = u16::try_from(bands)
        .map_err(|_| TreeTileError::UnsupportedSampleFormat(format!("{} bands", bands)))?;
    let mut dir = encoder.image_directory()?;

    dir.write_tag(Tag::ImageWidth, width)?;
    dir.write_tag(Tag::ImageLength, height)?;
    dir.write_tag(Tag::BitsPerSample, &vec![16u16; bands][..])?;
    dir.write_tag(Tag::Compression, 1u16)?;
    dir.write_tag(Tag::PhotometricInterpretation, 1u16)?;
    dir.write_tag(Tag::SamplesPerPixel, samples)?;
    dir.write_tag(Tag::SampleFormat, &vec![1u16; bands][..])?;
    dir.write_tag(Tag::PlanarConfiguration, 1u16)?;
    dir.write_tag(Tag::RowsPerStrip, height)?;
    if bands > 1 {
        dir.write_tag(Tag::ExtraSamples, &vec![0u16; bands - 1][..])?;
    }
    write_geotiff_tags(&mut dir, raster.transform(), raster.epsg())?;

    let offset = dir.write_data(interleaved)?;
    let offset = u32::try_from(offset)
        .map_err(|_| TreeTileError::UnsupportedSampleFormat("strip offset exceeds 4 GiB".to_string()))?;
    dir.write_tag(Tag::StripOffsets, offset)?;
    let byte_count = u32::try_from(interleaved.len() * 2)
        .map_err(|_| TreeTileError::UnsupportedSampleFormat("strip exceeds 4 GiB".to_string()))?;
    dir.write_tag(Tag::StripByteCounts, byte_count)?;
    dir.finish()?;
    Ok(())
}

/// Write a single-band class map with the source raster's georeferencing.
pub fn write_class_map<P: AsRef<Path>>(
    path: P,
    map: &Array2<u16>,
    transform: &GeoTransform,
    epsg: Option<u16>,
) -> Result<()> {
    let raster = Raster::new(map.clone().insert_axis(Axis(0)), *transform, epsg)?;
    write_raster(path, &raster)
}
