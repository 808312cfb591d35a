use std::path::Path;

use image::DynamicImage;
use log::info;

use crate::{
    error::{ImageError, PrintError},
    pipeline::ConvertMode,
    printer::PrinterState,
    raster::{PrintJob, RasterImage},
    session::SessionHandle,
};

/// Holds the one image waiting to be printed next to a session.
pub struct PrintDesk {
    session: SessionHandle,
    mode: ConvertMode,
    job: Option<PrintJob>,
}

impl PrintDesk {
    pub fn new(session: SessionHandle, mode: ConvertMode) -> Self {
        Self {
            session,
            mode,
            job: None,
        }
    }

    /// A failed load leaves no job behind, not even the previous one.
    pub fn load_path(&mut self, path: impl AsRef<Path>) -> Result<&RasterImage, ImageError> {
        self.job = None;
        let job = PrintJob::open(path, self.mode)?;
        Ok(self.put(job))
    }

    pub fn load_image(&mut self, img: &DynamicImage) -> Result<&RasterImage, ImageError> {
        self.job = None;
        let job = PrintJob::from_image(img, self.mode)?;
        Ok(self.put(job))
    }

    fn put(&mut self, job: PrintJob) -> &RasterImage {
        info!("loaded {}x{} raster", job.raster().width(), job.raster().height());
        self.job.insert(job).raster()
    }

    pub fn preview(&self) -> Option<&RasterImage> {
        self.job.as_ref().map(PrintJob::raster)
    }

    pub fn clear(&mut self) {
        self.job = None;
    }

    pub fn state(&self) -> PrinterState {
        self.session.state()
    }

    pub fn can_print(&self) -> bool {
        self.job.is_some() && self.state().is_ready()
    }

    /// Send the loaded job. The job stays loaded if the printer turns it down.
    pub async fn print(&mut self) -> Result<(), PrintError> {
        let job = self.job.clone().ok_or(PrintError::NotReady)?;
        self.session.print(job).await?;
        self.job = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use image::{Rgba, RgbaImage};
    use tokio::time::timeout;

    use super::*;
    use crate::{
        session::{self, SessionConfig},
        sim::{SimConfig, SimulatedLink},
    };

    fn img() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(48, 64, Rgba([0, 0, 0, 255])))
    }

    #[tokio::test]
    async fn test_load_clear_print() {
        let link = SimulatedLink::new(SimConfig::default());
        let control = link.control();
        let config = SessionConfig {
            poll_interval: Duration::from_millis(5),
            chunk_delay: Duration::ZERO,
            ..SessionConfig::default()
        };
        let (handle, _task) = session::spawn(link, config);
        let mut desk = PrintDesk::new(handle.clone(), ConvertMode::Dithered);

        assert_eq!(desk.print().await, Err(PrintError::NotReady));

        let raster = desk.load_image(&img()).unwrap();
        assert_eq!(raster.height(), 512);
        desk.clear();
        assert!(desk.preview().is_none());

        desk.load_image(&img()).unwrap();
        timeout(Duration::from_secs(5), handle.wait_ready())
            .await
            .unwrap()
            .unwrap();
        assert!(desk.can_print());

        desk.print().await.unwrap();
        assert!(desk.preview().is_none());

        timeout(Duration::from_secs(5), async {
            while control.printed().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(control.printed()[0].len(), crate::t02::encoded_len(512));
    }

    #[test]
    fn test_failed_load_drops_previous() {
        let (_session, handle) = session::Session::new(SimulatedLink::default(), SessionConfig::default());
        let mut desk = PrintDesk::new(handle, ConvertMode::Threshold);
        desk.load_image(&img()).unwrap();

        let empty = DynamicImage::ImageRgba8(RgbaImage::new(0, 0));
        assert!(desk.load_image(&empty).is_err());
        assert!(desk.preview().is_none());
        assert!(!desk.can_print());
    }
}
