//! End-to-end scenarios exercising the whole engine surface.
